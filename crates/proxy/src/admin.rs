use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::engine::Engine;
use crate::error::ProxyError;

/// The small read-only admin surface (spec §10.F). Off by default; bound
/// only when `Config.admin` is set. Built with axum rather than the
/// hand-rolled `proxy::wire` pipeline, since this surface answers a handful
/// of fixed JSON routes instead of proxying arbitrary requests.
pub fn router(engine: Arc<Engine>) -> Router {
	Router::new()
		.route("/cert", get(get_cert))
		.route("/pool", get(get_pool))
		.route("/healthz", get(get_healthz))
		.with_state(engine)
}

pub async fn serve(engine: Arc<Engine>, host: &str, port: u16) -> Result<(), ProxyError> {
	let listener = tokio::net::TcpListener::bind((host, port))
		.await
		.map_err(ProxyError::ListenerFailed)?;
	axum::serve(listener, router(engine))
		.await
		.map_err(|e| ProxyError::ListenerFailed(std::io::Error::other(e)))
}

async fn get_cert(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
	(
		[(axum::http::header::CONTENT_TYPE, "application/x-pem-file")],
		engine.ca_public_cert_pem().to_string(),
	)
}

#[derive(Serialize)]
struct PoolEntryView {
	scheme: String,
	host: String,
	port: u16,
	policy_fingerprint: String,
	acquired: u64,
	reused: u64,
	created: u64,
	closed: u64,
}

async fn get_pool(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
	let entries: Vec<PoolEntryView> = engine
		.shared()
		.client
		.all_counters()
		.into_iter()
		.map(|(key, counters)| PoolEntryView {
			scheme: key.scheme,
			host: key.host,
			port: key.port,
			policy_fingerprint: key.policy_fingerprint,
			acquired: counters.acquired,
			reused: counters.reused,
			created: counters.created,
			closed: counters.closed,
		})
		.collect();
	Json(entries)
}

async fn get_healthz() -> impl IntoResponse {
	"ok"
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use axum::body::to_bytes;
	use axum::http::Request;
	use tower::ServiceExt;

	#[tokio::test]
	async fn healthz_returns_ok() {
		let engine = Arc::new(Engine::new(Config::default()).await.unwrap());
		let app = router(engine);
		let response = app
			.oneshot(Request::builder().uri("/healthz").body(axum::body::Body::empty()).unwrap())
			.await
			.unwrap();
		let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		assert_eq!(&body[..], b"ok");
	}

	#[tokio::test]
	async fn cert_route_serves_pem() {
		let engine = Arc::new(Engine::new(Config::default()).await.unwrap());
		let app = router(engine);
		let response = app
			.oneshot(Request::builder().uri("/cert").body(axum::body::Body::empty()).unwrap())
			.await
			.unwrap();
		let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		assert!(String::from_utf8_lossy(&body).contains("BEGIN CERTIFICATE"));
	}

	#[tokio::test]
	async fn pool_route_starts_empty() {
		let engine = Arc::new(Engine::new(Config::default()).await.unwrap());
		let app = router(engine);
		let response = app
			.oneshot(Request::builder().uri("/pool").body(axum::body::Body::empty()).unwrap())
			.await
			.unwrap();
		let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		assert_eq!(&body[..], b"[]");
	}
}
