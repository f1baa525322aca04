use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio::sync::Semaphore;

use crate::error::ProxyError;
use crate::middleware::Phase;

/// Replaces the context's forward plan wholesale or per-field
/// (spec §4.F "overrides: {method?, url?, headers?, body?, protocol?}").
/// Header merging is case-insensitive with last-writer-wins; a header with
/// value `None` in `headers` deletes the key.
#[derive(Debug, Clone, Default)]
pub struct ForwardOverrides {
	pub method: Option<Method>,
	pub url: Option<Uri>,
	pub headers: Option<Vec<(String, Option<String>)>>,
	pub body: Option<Bytes>,
	pub protocol: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ShortCircuitResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl ShortCircuitResponse {
	/// Used by the `STOP` variant: an empty 204 unless the interceptor
	/// supplied its own status (spec §4.F "as SHORT_CIRCUIT but with an
	/// empty body and status 204 if none supplied").
	fn stop_default() -> ShortCircuitResponse {
		ShortCircuitResponse {
			status: StatusCode::NO_CONTENT,
			headers: HeaderMap::new(),
			body: Bytes::new(),
		}
	}
}

/// What an interceptor's handler decided (spec §3 "Interceptor Result").
#[derive(Debug, Clone)]
pub enum InterceptorResult {
	Continue,
	ModifyAndForward(ForwardOverrides),
	ShortCircuit(ShortCircuitResponse),
	Stop,
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<InterceptorResult, ProxyError>> + Send + 'a>>;
type GateFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

pub trait Handler<C>: Send + Sync {
	fn call<'a>(&'a self, ctx: &'a mut C) -> HandlerFuture<'a>;
}

impl<C, F, Fut> Handler<C> for F
where
	F: for<'a> Fn(&'a mut C) -> Fut + Send + Sync,
	Fut: Future<Output = Result<InterceptorResult, ProxyError>> + Send + 'static,
{
	fn call<'a>(&'a self, ctx: &'a mut C) -> HandlerFuture<'a> {
		Box::pin(self(ctx))
	}
}

/// The `shouldIntercept` gate, checked before a handler runs (spec §4.F).
/// Defaults to "always" via the blanket `Fn` impl so registrations that
/// don't need conditional matching can omit a gate entirely.
pub trait Gate<C>: Send + Sync {
	fn matches<'a>(&'a self, ctx: &'a C) -> GateFuture<'a>;
}

impl<C, F> Gate<C> for F
where
	F: for<'a> Fn(&'a C) -> bool + Send + Sync,
{
	fn matches<'a>(&'a self, ctx: &'a C) -> GateFuture<'a> {
		let result = self(ctx);
		Box::pin(async move { result })
	}
}

struct Record<C> {
	name: String,
	priority: i64,
	phases: Option<HashSet<Phase>>,
	critical: bool,
	exclusive: bool,
	/// Whether this interceptor may rewrite the message body it runs over
	/// (spec §5 backpressure: a body is only buffered into memory when a
	/// *registered* interceptor declares it needs to see/replace one).
	wants_body: bool,
	gate: Arc<dyn Gate<C>>,
	handler: Arc<dyn Handler<C>>,
}

impl<C> Clone for Record<C> {
	fn clone(&self) -> Self {
		Record {
			name: self.name.clone(),
			priority: self.priority,
			phases: self.phases.clone(),
			critical: self.critical,
			exclusive: self.exclusive,
			wants_body: self.wants_body,
			gate: self.gate.clone(),
			handler: self.handler.clone(),
		}
	}
}

/// Shared with the middleware registries so interceptor handler concurrency
/// counts against the same backpressure budget (spec §4.E/§4.F share the
/// "maximum concurrent in-flight" bound).
#[derive(Clone)]
pub struct InterceptorBudget {
	semaphore: Arc<Semaphore>,
}

impl InterceptorBudget {
	pub fn new(max_concurrent: usize) -> InterceptorBudget {
		InterceptorBudget {
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

/// Applies a decided `ForwardOverrides` onto whatever forward-plan shape the
/// calling context owns, so one generic `Chain<C>` can run over
/// `RequestContext`, `ConnectContext`, or `UpgradeContext` alike. `phase`
/// tells the implementor which forward plan the override targets — the
/// same `ForwardOverrides` shape is used for both the request-side and
/// response-side phases, and a response-phase override must land on the
/// response fields, not the request ones.
pub trait ApplyOverrides {
	fn apply_overrides(&mut self, phase: Phase, overrides: ForwardOverrides);
}

/// A copy-on-write registry of interceptors for one context type, ordered
/// descending by `(priority, name)` — the reverse of `middleware::Chain`
/// (spec §3 "interceptor ordering: descending priority then lexicographic
/// name").
pub struct Chain<C> {
	records: ArcSwap<Vec<Record<C>>>,
	timeout: Duration,
}

/// What running a phase of the chain produced, for the pipeline to act on.
pub enum ChainOutcome {
	/// No interceptor short-circuited or stopped; forward plan may have been
	/// modified in place via `ApplyOverrides`.
	Continue,
	ShortCircuit(ShortCircuitResponse),
}

impl<C: ApplyOverrides> Chain<C> {
	pub fn new(timeout: Duration) -> Chain<C> {
		Chain {
			records: ArcSwap::from_pointee(Vec::new()),
			timeout,
		}
	}

	#[allow(clippy::too_many_arguments)]
	pub fn register(
		&self,
		name: impl Into<String>,
		priority: i64,
		phases: Option<HashSet<Phase>>,
		critical: bool,
		exclusive: bool,
		wants_body: bool,
		gate: impl Gate<C> + 'static,
		handler: impl Handler<C> + 'static,
	) {
		let name = name.into();
		let gate: Arc<dyn Gate<C>> = Arc::new(gate);
		let handler: Arc<dyn Handler<C>> = Arc::new(handler);
		self.records.rcu(move |current| {
			let mut next: Vec<Record<C>> = current.iter().filter(|r| r.name != name).cloned().collect();
			next.push(Record {
				name: name.clone(),
				priority,
				phases: phases.clone(),
				critical,
				exclusive,
				wants_body,
				gate: gate.clone(),
				handler: handler.clone(),
			});
			// Descending priority, then lexicographic name, mirroring the
			// middleware chain's ascending sort but inverted on priority.
			next.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
			Arc::new(next)
		});
	}

	/// Whether any interceptor registered for `phase` declared `wants_body`
	/// (spec §5: the pipeline only buffers a body into memory when this is
	/// true, checked once before the chain runs rather than per-handler,
	/// since a handler needs the body already in hand to decide anything
	/// about it).
	pub fn phase_wants_body(&self, phase: Phase) -> bool {
		let records = self.records.load();
		records.iter().any(|r| {
			r.wants_body
				&& r
					.phases
					.as_ref()
					.map(|phases| phases.contains(&phase))
					.unwrap_or(true)
		})
	}

	pub fn remove(&self, name: &str) {
		self.records.rcu(|current| {
			Arc::new(current.iter().filter(|r| r.name != name).cloned().collect())
		});
	}

	/// Runs every interceptor applicable to `phase` whose gate matches,
	/// applying `MODIFY_AND_FORWARD` overrides to `ctx` in place and
	/// returning a `ChainOutcome` once the chain completes, short-circuits,
	/// or stops (spec §4.F).
	pub async fn run(
		&self,
		phase: Phase,
		ctx: &mut C,
		budget: &InterceptorBudget,
	) -> Result<ChainOutcome, ProxyError> {
		let records = self.records.load();
		for record in records.iter() {
			if let Some(phases) = &record.phases
				&& !phases.contains(&phase)
			{
				continue;
			}
			if !record.gate.matches(ctx).await {
				continue;
			}

			let _permit = budget.try_acquire()?;
			let result = tokio::time::timeout(self.timeout, record.handler.call(ctx)).await;
			let result = match result {
				Ok(r) => r,
				Err(_) => Err(ProxyError::InterceptorTimeout {
					name: record.name.clone(),
				}),
			};

			let outcome = match result {
				Ok(outcome) => outcome,
				Err(e) if record.critical => return Err(e),
				Err(_) => continue,
			};

			match outcome {
				InterceptorResult::Continue => continue,
				InterceptorResult::ModifyAndForward(overrides) => {
					ctx.apply_overrides(phase, overrides);
					if record.exclusive {
						return Ok(ChainOutcome::Continue);
					}
				},
				InterceptorResult::ShortCircuit(resp) => return Ok(ChainOutcome::ShortCircuit(resp)),
				InterceptorResult::Stop => return Ok(ChainOutcome::ShortCircuit(ShortCircuitResponse::stop_default())),
			}
		}
		Ok(ChainOutcome::Continue)
	}
}
