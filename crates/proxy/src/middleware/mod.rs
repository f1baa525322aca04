use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Semaphore;

use crate::error::ProxyError;

/// The phases middleware and interceptors can hook, per the data model's
/// "phase filter set". Not every registry runs every variant — the HTTP
/// request pipeline only ever asks for the four `*Request`/`*Response`
/// phases plus `onError`, while the CONNECT and upgrade paths ask for their
/// own pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
	BeforeRequest,
	AfterRequest,
	BeforeResponse,
	AfterResponse,
	BeforeConnect,
	AfterConnect,
	BeforeUpgrade,
	AfterUpgrade,
	OnError,
}

/// What a middleware handler decided. `Stop` skips the remaining handlers in
/// this phase (spec §4.E "sets `stopped`") without failing the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareOutcome {
	Proceed,
	Stop,
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<MiddlewareOutcome, ProxyError>> + Send + 'a>>;

/// A middleware's handler, generic over whatever context type the calling
/// registry operates on (`RequestContext`, `ConnectContext`, or
/// `UpgradeContext` — module G/H/I each instantiate their own `Chain<C>`).
pub trait Handler<C>: Send + Sync {
	fn call<'a>(&'a self, ctx: &'a mut C) -> HandlerFuture<'a>;
}

impl<C, F, Fut> Handler<C> for F
where
	F: for<'a> Fn(&'a mut C) -> Fut + Send + Sync,
	Fut: Future<Output = Result<MiddlewareOutcome, ProxyError>> + Send + 'static,
{
	fn call<'a>(&'a self, ctx: &'a mut C) -> HandlerFuture<'a> {
		Box::pin(self(ctx))
	}
}

struct Record<C> {
	name: String,
	priority: i64,
	phases: Option<HashSet<Phase>>,
	handler: Arc<dyn Handler<C>>,
}

/// Bounds the number of middleware handlers running concurrently across every
/// phase and every chain (spec §4.E "Maximum concurrent in-flight middleware
/// across all phases is bounded"). Shared by reference across all of an
/// engine's chains.
#[derive(Clone)]
pub struct MiddlewareBudget {
	semaphore: Arc<Semaphore>,
}

impl MiddlewareBudget {
	pub fn new(max_concurrent: usize) -> MiddlewareBudget {
		MiddlewareBudget {
			semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
		}
	}

	fn try_acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit, ProxyError> {
		self
			.semaphore
			.clone()
			.try_acquire_owned()
			.map_err(|_| ProxyError::Overload)
	}
}

/// A copy-on-write registry of middleware for one context type, ordered
/// ascending by `(priority, name)` per spec §3. Registration swaps in a
/// freshly sorted `Vec` so readers never observe a partially-updated list.
pub struct Chain<C> {
	records: ArcSwap<Vec<Record<C>>>,
	timeout: Duration,
}

impl<C> Chain<C> {
	pub fn new(timeout: Duration) -> Chain<C> {
		Chain {
			records: ArcSwap::from_pointee(Vec::new()),
			timeout,
		}
	}

	pub fn register(
		&self,
		name: impl Into<String>,
		priority: i64,
		phases: Option<HashSet<Phase>>,
		handler: impl Handler<C> + 'static,
	) {
		let name = name.into();
		let handler: Arc<dyn Handler<C>> = Arc::new(handler);
		self.records.rcu(move |current| {
			let mut next: Vec<Record<C>> = current
				.iter()
				.filter(|r| r.name != name)
				.map(|r| Record {
					name: r.name.clone(),
					priority: r.priority,
					phases: r.phases.clone(),
					handler: r.handler.clone(),
				})
				.collect();
			next.push(Record {
				name: name.clone(),
				priority,
				phases: phases.clone(),
				handler: handler.clone(),
			});
			next.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
			Arc::new(next)
		});
	}

	pub fn remove(&self, name: &str) {
		self.records.rcu(|current| {
			Arc::new(
				current
					.iter()
					.filter(|r| r.name != name)
					.map(|r| Record {
						name: r.name.clone(),
						priority: r.priority,
						phases: r.phases.clone(),
						handler: r.handler.clone(),
					})
					.collect(),
			)
		});
	}

	/// Runs every handler applicable to `phase`, in order, stopping early on
	/// `MiddlewareOutcome::Stop` (spec §4.E). Each handler gets `self.timeout`
	/// and must acquire a slot from `budget` before running.
	pub async fn run(&self, phase: Phase, ctx: &mut C, budget: &MiddlewareBudget) -> Result<(), ProxyError> {
		let records = self.records.load();
		for record in records.iter() {
			if let Some(phases) = &record.phases {
				if !phases.contains(&phase) {
					continue;
				}
			}
			let _permit = budget.try_acquire()?;
			let outcome = tokio::time::timeout(self.timeout, record.handler.call(ctx))
				.await
				.map_err(|_| ProxyError::MiddlewareTimeout {
					name: record.name.clone(),
				})??;
			if outcome == MiddlewareOutcome::Stop {
				break;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Default)]
	struct Ctx {
		trail: Vec<&'static str>,
	}

	#[tokio::test]
	async fn runs_in_ascending_priority_then_name_order() {
		let chain: Chain<Ctx> = Chain::new(Duration::from_secs(1));
		chain.register("b", 5, None, |ctx: &mut Ctx| async move {
			ctx.trail.push("b");
			Ok(MiddlewareOutcome::Proceed)
		});
		chain.register("a", 5, None, |ctx: &mut Ctx| async move {
			ctx.trail.push("a");
			Ok(MiddlewareOutcome::Proceed)
		});
		chain.register("z", 1, None, |ctx: &mut Ctx| async move {
			ctx.trail.push("z");
			Ok(MiddlewareOutcome::Proceed)
		});

		let mut ctx = Ctx::default();
		let budget = MiddlewareBudget::new(100);
		chain.run(Phase::BeforeRequest, &mut ctx, &budget).await.unwrap();
		assert_eq!(ctx.trail, vec!["z", "a", "b"]);
	}

	#[tokio::test]
	async fn phase_filter_skips_non_matching_handlers() {
		let chain: Chain<Ctx> = Chain::new(Duration::from_secs(1));
		let mut only_before = HashSet::new();
		only_before.insert(Phase::BeforeRequest);
		chain.register("only-before", 0, Some(only_before), |ctx: &mut Ctx| async move {
			ctx.trail.push("only-before");
			Ok(MiddlewareOutcome::Proceed)
		});

		let mut ctx = Ctx::default();
		let budget = MiddlewareBudget::new(100);
		chain.run(Phase::AfterRequest, &mut ctx, &budget).await.unwrap();
		assert!(ctx.trail.is_empty());
		chain.run(Phase::BeforeRequest, &mut ctx, &budget).await.unwrap();
		assert_eq!(ctx.trail, vec!["only-before"]);
	}

	#[tokio::test]
	async fn stop_outcome_halts_remaining_handlers() {
		let chain: Chain<Ctx> = Chain::new(Duration::from_secs(1));
		chain.register("first", 0, None, |ctx: &mut Ctx| async move {
			ctx.trail.push("first");
			Ok(MiddlewareOutcome::Stop)
		});
		chain.register("second", 1, None, |ctx: &mut Ctx| async move {
			ctx.trail.push("second");
			Ok(MiddlewareOutcome::Proceed)
		});

		let mut ctx = Ctx::default();
		let budget = MiddlewareBudget::new(100);
		chain.run(Phase::BeforeRequest, &mut ctx, &budget).await.unwrap();
		assert_eq!(ctx.trail, vec!["first"]);
	}

	#[tokio::test]
	async fn timeout_reports_the_offending_middleware_by_name() {
		let chain: Chain<Ctx> = Chain::new(Duration::from_millis(10));
		chain.register("slow", 0, None, |_ctx: &mut Ctx| async move {
			tokio::time::sleep(Duration::from_secs(5)).await;
			Ok(MiddlewareOutcome::Proceed)
		});

		let mut ctx = Ctx::default();
		let budget = MiddlewareBudget::new(100);
		let err = chain
			.run(Phase::BeforeRequest, &mut ctx, &budget)
			.await
			.unwrap_err();
		match err {
			ProxyError::MiddlewareTimeout { name } => assert_eq!(name, "slow"),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[tokio::test]
	async fn exhausted_budget_fails_with_overload() {
		let chain: Chain<Ctx> = Chain::new(Duration::from_secs(1));
		chain.register("h", 0, None, |_ctx: &mut Ctx| async move {
			tokio::time::sleep(Duration::from_millis(50)).await;
			Ok(MiddlewareOutcome::Proceed)
		});

		let budget = MiddlewareBudget::new(1);
		let _permit = budget.try_acquire().unwrap();
		let mut ctx = Ctx::default();
		let err = chain.run(Phase::BeforeRequest, &mut ctx, &budget).await.unwrap_err();
		assert!(matches!(err, ProxyError::Overload));
	}
}
