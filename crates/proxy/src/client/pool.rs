use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::PoolConfig;
use crate::error::ProxyError;
use crate::transport::stream::Socket;

/// `(scheme, host, port, policyFingerprint)` so that a direct pool and a
/// proxied pool for the same origin never share sockets (spec §4.D).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
	pub scheme: String,
	pub host: String,
	pub port: u16,
	pub policy_fingerprint: String,
}

impl PoolKey {
	pub fn new(
		scheme: impl Into<String>,
		host: impl Into<String>,
		port: u16,
		policy_fingerprint: impl Into<String>,
	) -> PoolKey {
		PoolKey {
			scheme: scheme.into(),
			host: host.into(),
			port,
			policy_fingerprint: policy_fingerprint.into(),
		}
	}
}

#[derive(Debug, Default)]
pub struct PoolCounters {
	pub acquired: AtomicU64,
	pub reused: AtomicU64,
	pub created: AtomicU64,
	pub closed: AtomicU64,
}

impl PoolCounters {
	pub fn snapshot(&self) -> PoolCountersSnapshot {
		PoolCountersSnapshot {
			acquired: self.acquired.load(Ordering::Relaxed),
			reused: self.reused.load(Ordering::Relaxed),
			created: self.created.load(Ordering::Relaxed),
			closed: self.closed.load(Ordering::Relaxed),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCountersSnapshot {
	pub acquired: u64,
	pub reused: u64,
	pub created: u64,
	pub closed: u64,
}

struct IdleEntry {
	socket: Socket,
	last_use: Instant,
	_permit: OwnedSemaphorePermit,
}

struct KeyEntry {
	semaphore: Arc<Semaphore>,
	idle: tokio::sync::Mutex<VecDeque<IdleEntry>>,
	counters: PoolCounters,
}

impl KeyEntry {
	fn new(max_sockets: usize) -> KeyEntry {
		KeyEntry {
			semaphore: Arc::new(Semaphore::new(max_sockets)),
			idle: tokio::sync::Mutex::new(VecDeque::new()),
			counters: PoolCounters::default(),
		}
	}
}

/// A connection checked out of the pool. `release` (consuming) decides
/// whether it goes back to the idle queue or is closed outright.
pub struct PooledConn {
	pub socket: Socket,
	key: PoolKey,
	permit: OwnedSemaphorePermit,
}

impl PooledConn {
	pub fn key(&self) -> &PoolKey {
		&self.key
	}
}

/// Per-origin keep-alive pool, bounded by `maxSockets`/`maxFreeSockets` and
/// reclaiming idle entries past `idleTimeout` (spec §4.D).
pub struct Pool {
	keys: Mutex<HashMap<PoolKey, Arc<KeyEntry>>>,
	config: PoolConfig,
}

impl Pool {
	pub fn new(config: PoolConfig) -> Pool {
		Pool {
			keys: Mutex::new(HashMap::new()),
			config,
		}
	}

	fn entry_for(&self, key: &PoolKey) -> Arc<KeyEntry> {
		let mut keys = self.keys.lock();
		keys
			.entry(key.clone())
			.or_insert_with(|| Arc::new(KeyEntry::new(self.config.max_sockets)))
			.clone()
	}

	/// Pops the youngest-idle (MRU) healthy entry, or dials a new one via
	/// `dial` if none is available, blocking on the per-key socket budget up
	/// to `waitTimeout`.
	pub async fn acquire<F, Fut>(&self, key: &PoolKey, dial: F) -> Result<PooledConn, ProxyError>
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = Result<Socket, ProxyError>>,
	{
		let entry = self.entry_for(key);
		entry.counters.acquired.fetch_add(1, Ordering::Relaxed);

		if let Some(conn) = self.try_reuse(key, &entry).await {
			return Ok(conn);
		}

		let permit = tokio::time::timeout(
			self.config.wait_timeout,
			entry.semaphore.clone().acquire_owned(),
		)
		.await
		.map_err(|_| ProxyError::PoolExhausted)?
		.expect("semaphore is never closed");

		// Another task may have released a fresh idle entry while we waited
		// for a permit (released sockets don't consume a new permit).
		if let Some(conn) = self.try_reuse(key, &entry).await {
			drop(permit);
			return Ok(conn);
		}

		match dial().await {
			Ok(socket) => {
				entry.counters.created.fetch_add(1, Ordering::Relaxed);
				Ok(PooledConn {
					socket,
					key: key.clone(),
					permit,
				})
			},
			Err(e) => {
				drop(permit);
				Err(e)
			},
		}
	}

	async fn try_reuse(&self, key: &PoolKey, entry: &Arc<KeyEntry>) -> Option<PooledConn> {
		let mut idle = entry.idle.lock().await;
		while let Some(candidate) = idle.pop_back() {
			let stale = candidate.last_use.elapsed() >= self.config.idle_timeout;
			if stale || !candidate.socket.is_plausibly_alive() {
				entry.counters.closed.fetch_add(1, Ordering::Relaxed);
				continue;
			}
			entry.counters.reused.fetch_add(1, Ordering::Relaxed);
			return Some(PooledConn {
				socket: candidate.socket,
				key: key.clone(),
				permit: candidate._permit,
			});
		}
		None
	}

	/// Returns `conn` to its key's idle queue iff `healthy` and the queue has
	/// room; otherwise the connection (and its socket budget permit) is
	/// dropped.
	pub async fn release(&self, conn: PooledConn, healthy: bool) {
		let entry = self.entry_for(&conn.key);
		if !healthy {
			entry.counters.closed.fetch_add(1, Ordering::Relaxed);
			return;
		}

		let mut idle = entry.idle.lock().await;
		if idle.len() >= self.config.max_free_sockets {
			idle.pop_front();
			entry.counters.closed.fetch_add(1, Ordering::Relaxed);
		}
		idle.push_back(IdleEntry {
			socket: conn.socket,
			last_use: Instant::now(),
			_permit: conn.permit,
		});
	}

	/// Closes every idle entry for `key`, used on config reload (spec §6
	/// "reload closes pools").
	pub async fn destroy(&self, key: &PoolKey) {
		let entry = {
			let mut keys = self.keys.lock();
			keys.remove(key)
		};
		if let Some(entry) = entry {
			let mut idle = entry.idle.lock().await;
			entry
				.counters
				.closed
				.fetch_add(idle.len() as u64, Ordering::Relaxed);
			idle.clear();
		}
	}

	pub fn counters(&self, key: &PoolKey) -> Option<PoolCountersSnapshot> {
		let keys = self.keys.lock();
		keys.get(key).map(|e| e.counters.snapshot())
	}

	/// Every key the pool currently tracks, with its counters. Used by the
	/// admin surface's `/pool` route; not on any request hot path.
	pub fn all_counters(&self) -> Vec<(PoolKey, PoolCountersSnapshot)> {
		let keys = self.keys.lock();
		keys
			.iter()
			.map(|(k, e)| (k.clone(), e.counters.snapshot()))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_config() -> PoolConfig {
		PoolConfig {
			max_sockets: 2,
			max_free_sockets: 1,
			idle_timeout: Duration::from_secs(60),
			wait_timeout: Duration::from_millis(200),
		}
	}

	async fn loopback_socket() -> Socket {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
		let client = tokio::net::TcpStream::connect(addr).await.unwrap();
		accept.await.unwrap();
		Socket::plain(client)
	}

	#[tokio::test]
	async fn dials_when_idle_queue_is_empty() {
		let pool = Pool::new(test_config());
		let key = PoolKey::new("http", "example.test", 80, "direct");
		let conn = pool
			.acquire(&key, || async { Ok(loopback_socket().await) })
			.await
			.unwrap();
		assert_eq!(pool.counters(&key).unwrap().created, 1);
		pool.release(conn, true).await;
	}

	#[tokio::test]
	async fn reuses_a_released_connection() {
		let pool = Pool::new(test_config());
		let key = PoolKey::new("http", "example.test", 80, "direct");
		let conn = pool
			.acquire(&key, || async { Ok(loopback_socket().await) })
			.await
			.unwrap();
		pool.release(conn, true).await;

		let conn2 = pool
			.acquire(&key, || async { panic!("should not dial again") })
			.await
			.unwrap();
		let counters = pool.counters(&key).unwrap();
		assert_eq!(counters.created, 1);
		assert_eq!(counters.reused, 1);
		pool.release(conn2, true).await;
	}

	#[tokio::test]
	async fn max_sockets_bound_yields_pool_exhausted() {
		let pool = Pool::new(test_config());
		let key = PoolKey::new("http", "example.test", 80, "direct");
		let conn1 = pool
			.acquire(&key, || async { Ok(loopback_socket().await) })
			.await
			.unwrap();
		let conn2 = pool
			.acquire(&key, || async { Ok(loopback_socket().await) })
			.await
			.unwrap();

		let err = pool
			.acquire(&key, || async { Ok(loopback_socket().await) })
			.await
			.unwrap_err();
		assert!(matches!(err, ProxyError::PoolExhausted));

		pool.release(conn1, true).await;
		pool.release(conn2, true).await;
	}

	#[tokio::test]
	async fn unhealthy_release_does_not_populate_idle_queue() {
		let pool = Pool::new(test_config());
		let key = PoolKey::new("http", "example.test", 80, "direct");
		let conn = pool
			.acquire(&key, || async { Ok(loopback_socket().await) })
			.await
			.unwrap();
		pool.release(conn, false).await;

		let conn2 = pool
			.acquire(&key, || async { Ok(loopback_socket().await) })
			.await
			.unwrap();
		assert_eq!(pool.counters(&key).unwrap().created, 2);
		pool.release(conn2, true).await;
	}
}
