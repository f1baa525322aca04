use std::sync::Arc;

use crate::ca::CertificateAuthority;
use crate::cert::CertStore;
use crate::client::{Client, UpstreamSelector};
use crate::config::Config;
use crate::error::ProxyError;
use crate::interceptor;
use crate::interceptor::InterceptorBudget;
use crate::middleware;
use crate::middleware::MiddlewareBudget;
use crate::proxy::mitm::MitmPolicy;
use crate::proxy::pipeline::RequestContext;
use crate::proxy::ws::MessageInterceptors;
use crate::proxy::ProxyShared;

/// Builds the pieces every connection task shares and owns their lifetime
/// (spec's data model: CA, cert store, client, and the two handler
/// registries, all wired from one `Config`).
///
/// Middleware and interceptors are registered imperatively against
/// `Engine::middleware()`/`Engine::interceptor()` after construction, the way
/// the embedding application wires up its own handlers in Rust rather than
/// through the config file; `Config` only carries the ambient timeouts and
/// budgets those registries run under.
pub struct Engine {
	ca: Arc<CertificateAuthority>,
	shared: Arc<ProxyShared>,
	config: Config,
}

impl Engine {
	pub async fn new(config: Config) -> Result<Engine, ProxyError> {
		Engine::with_upstream_selector(config, UpstreamSelector::None).await
	}

	pub async fn with_upstream_selector(config: Config, selector: UpstreamSelector) -> Result<Engine, ProxyError> {
		let ca = Arc::new(load_or_generate_ca(&config).await?);
		let cert_store = Arc::new(CertStore::new(
			ca.clone(),
			config.cert.cache_size,
			config.cert.leaf_ttl,
			config.cert.leaf_skew,
			config.cert.negative_ttl,
		));
		let client = Arc::new(Client::with_upstream_selector(&config, selector)?);
		let mitm_policy = MitmPolicy::new(&config.mitm);

		let middleware: middleware::Chain<RequestContext> = middleware::Chain::new(config.middleware.timeout);
		let middleware_budget = MiddlewareBudget::new(config.middleware.max_concurrent);
		let interceptor: interceptor::Chain<RequestContext> = interceptor::Chain::new(config.interceptor.timeout);
		// Shares the middleware budget's concurrency bound (spec §4.E/§4.F:
		// one "maximum concurrent in-flight" limit across both registries).
		let interceptor_budget = InterceptorBudget::new(config.middleware.max_concurrent);

		let shared = Arc::new(ProxyShared {
			client,
			cert_store,
			mitm_policy,
			middleware,
			middleware_budget,
			interceptor,
			interceptor_budget,
			message_interceptors: Arc::new(MessageInterceptors::new()),
			max_body_buffer: crate::config::max_body_buffer(),
			config: config.clone(),
		});

		Ok(Engine { ca, shared, config })
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn shared(&self) -> Arc<ProxyShared> {
		self.shared.clone()
	}

	pub fn middleware(&self) -> &middleware::Chain<RequestContext> {
		&self.shared.middleware
	}

	pub fn interceptor(&self) -> &interceptor::Chain<RequestContext> {
		&self.shared.interceptor
	}

	/// The WebSocket per-message interceptor registry (spec module I step 4).
	/// Empty by default, in which case the upgrade path falls back to a raw
	/// byte splice instead of parsing frames.
	pub fn message_interceptors(&self) -> &MessageInterceptors {
		&self.shared.message_interceptors
	}

	/// The CA's public certificate, served by the admin `/cert` route so
	/// operators can install it in client trust stores.
	pub fn ca_public_cert_pem(&self) -> &str {
		self.ca.public_cert_pem()
	}

	/// Closes every idle pooled connection across every origin. The practical
	/// subset of spec §6's "reload closes pools, rebuilds chains, doesn't
	/// drop in-flight requests": the chains here are registered by embedding
	/// Rust code rather than by config, so there is nothing to rebuild from a
	/// new `Config` beyond the dial/pool settings baked into the `Client` at
	/// construction time. A full config-driven reload would additionally
	/// need the `Client` itself behind an `ArcSwap`, which is not yet done.
	pub async fn drain_pools(&self) {
		let keys: Vec<_> = self.shared.client.all_counters().into_iter().map(|(k, _)| k).collect();
		self.shared.client.destroy_all(keys).await;
	}
}

async fn load_or_generate_ca(config: &Config) -> Result<CertificateAuthority, ProxyError> {
	match (&config.ca.cert_path, &config.ca.key_path) {
		(Some(cert_path), Some(key_path)) => {
			CertificateAuthority::from_paths(std::path::Path::new(cert_path), std::path::Path::new(key_path)).await
		},
		(None, None) => CertificateAuthority::generate(),
		_ => Err(ProxyError::ConfigInvalid(
			"ca.certPath and ca.keyPath must be set together or not at all".into(),
		)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn builds_with_a_generated_ca_by_default() {
		let engine = Engine::new(Config::default()).await.unwrap();
		assert!(engine.ca_public_cert_pem().contains("BEGIN CERTIFICATE"));
	}

	#[tokio::test]
	async fn rejects_a_cert_path_without_a_key_path() {
		let mut config = Config::default();
		config.ca.cert_path = Some("/tmp/does-not-matter.pem".into());
		let err = Engine::new(config).await.unwrap_err();
		assert!(matches!(err, ProxyError::ConfigInvalid(_)));
	}
}
