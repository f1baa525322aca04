use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// A signal that can be watched for graceful shutdown.
///
/// `DrainTrigger` is held by whoever owns the lifecycle of the process (the
/// binary's main function, a signal handler). Cloning a `DrainWatcher` and
/// calling `signal()` on the trigger tells every watcher that a drain has
/// started; watchers then have `min_drain_time` to finish in-flight work
/// gracefully before `wait_for_drain` resolves regardless, bounded further by
/// `max_drain_time` as a hard deadline.
#[derive(Clone)]
pub struct DrainWatcher {
	rx: watch::Receiver<bool>,
	min_drain_time: Duration,
	max_drain_time: Duration,
}

pub struct DrainTrigger {
	tx: watch::Sender<bool>,
}

pub fn new(min_drain_time: Duration, max_drain_time: Duration) -> (DrainTrigger, DrainWatcher) {
	let (tx, rx) = watch::channel(false);
	(
		DrainTrigger { tx },
		DrainWatcher {
			rx,
			min_drain_time,
			max_drain_time,
		},
	)
}

impl DrainTrigger {
	/// Begin a drain. Idempotent; subsequent calls are no-ops.
	pub fn signal(&self) {
		let _ = self.tx.send(true);
	}

	/// Wait until no more `DrainWatcher`s exist (every listener/connection task
	/// has dropped its handle).
	pub async fn wait_for_drained(self) {
		self.tx.closed().await;
	}
}

impl DrainWatcher {
	pub fn is_draining(&self) -> bool {
		*self.rx.borrow()
	}

	/// Resolves once a drain signal has been sent. Intended to be raced
	/// against an accept loop's `accept()` future in a `tokio::select!`.
	pub async fn signaled(&mut self) {
		loop {
			if *self.rx.borrow() {
				return;
			}
			if self.rx.changed().await.is_err() {
				return;
			}
		}
	}

	/// Once draining has started, keep accepting new connections for
	/// `min_drain_time` (so clients mid-handshake aren't abruptly refused),
	/// then stop regardless.
	pub async fn drained_for_minimum(&mut self) {
		self.signaled().await;
		tokio::time::sleep(self.min_drain_time).await;
	}

	/// Run `work` to completion, but abandon it after `max_drain_time` once a
	/// drain has begun, whichever comes first.
	pub async fn bound<F: Future>(&mut self, work: F) -> Option<F::Output> {
		let deadline = if self.is_draining() {
			Some(Instant::now() + self.max_drain_time)
		} else {
			None
		};
		match deadline {
			Some(deadline) => tokio::select! {
				res = work => Some(res),
				_ = tokio::time::sleep_until(deadline) => None,
			},
			None => Some(work.await),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn signal_then_drained_for_minimum_respects_floor() {
		let (trigger, mut watcher) = new(Duration::from_millis(20), Duration::from_secs(5));
		assert!(!watcher.is_draining());
		let start = Instant::now();
		trigger.signal();
		watcher.drained_for_minimum().await;
		assert!(watcher.is_draining());
		assert!(start.elapsed() >= Duration::from_millis(20));
	}

	#[tokio::test]
	async fn wait_for_drained_resolves_once_watchers_drop() {
		let (trigger, watcher) = new(Duration::from_millis(1), Duration::from_millis(1));
		trigger.signal();
		drop(watcher);
		trigger.wait_for_drained().await;
	}
}
