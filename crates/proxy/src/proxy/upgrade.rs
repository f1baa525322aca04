use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use http::uri::Scheme;
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ProxyError;
use crate::interceptor::{self, ChainOutcome};
use crate::middleware::Phase;
use relay_core::copy::copy_bidirectional;

use super::pipeline::{self, RequestContext};
use super::wire;
use super::ProxyShared;

/// Handles a request already identified as a protocol upgrade (spec module
/// I). Runs the `beforeUpgrade` phase, replays the (possibly overridden)
/// request line to the chosen upstream, and once a `101` comes back forwards
/// it verbatim before splicing the two raw connections together for the
/// life of the upgraded protocol.
pub async fn handle<S: AsyncRead + AsyncWrite + Unpin>(
	head: wire::RequestHead,
	client: &mut S,
	scheme: Scheme,
	remote_addr: SocketAddr,
	shared: &ProxyShared,
) -> Result<(), ProxyError> {
	let mut headers = head.headers;
	let target_uri = pipeline::resolve_target_uri(&head.target, &headers, &scheme)?;
	let upgrade_type = headers.get(http::header::UPGRADE).cloned();
	pipeline::strip_hop_by_hop(&mut headers);
	// The upgrade itself is the one hop-by-hop exchange we must preserve.
	headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("Upgrade"));
	if let Some(upgrade_type) = upgrade_type {
		headers.insert(http::header::UPGRADE, upgrade_type);
	}

	// Mirrors the plain pipeline's NTLM affinity detection (spec §4.J): an
	// upgrade request carrying `Authorization` on its first (and only, since
	// the connection is about to be spliced) exchange still needs a pinned
	// pool entry for the handshake.
	let affinity = headers
		.contains_key(http::header::AUTHORIZATION)
		.then(|| Uuid::new_v4().to_string());

	let mut ctx = RequestContext {
		method: head.method,
		target_uri,
		version: head.version,
		headers,
		body: Bytes::new(),
		request_body_framing: wire::BodyFraming::None,
		scheme,
		remote_addr,
		correlation_id: Uuid::new_v4(),
		started_at: Instant::now(),
		cancellation: CancellationToken::new(),
		stopped: false,
		intercepted: false,
		short_circuit: None,
		response_status: None,
		response_headers: HeaderMap::new(),
		response_body: Bytes::new(),
		affinity,
	};

	shared
		.middleware
		.run(Phase::BeforeUpgrade, &mut ctx, &shared.middleware_budget)
		.await?;
	if let ChainOutcome::ShortCircuit(resp) = shared
		.interceptor
		.run(Phase::BeforeUpgrade, &mut ctx, &shared.interceptor_budget)
		.await?
	{
		return write_and_close(client, resp).await;
	}

	let dest = pipeline::destination_from_uri(&ctx.target_uri)?;
	let path = ctx
		.target_uri
		.path_and_query()
		.map(|p| p.as_str())
		.unwrap_or("/")
		.to_string();

	let mut conn = match pipeline::with_cancellation(
		client,
		&ctx.cancellation,
		shared.client.acquire_with_affinity(&dest, &ctx.target_uri, ctx.affinity.as_deref()),
	)
	.await
	{
		Ok(conn) => conn,
		Err(e) => return Err(e),
	};
	let upstream_head = match pipeline::with_cancellation(client, &ctx.cancellation, upstream_exchange(&mut conn.socket, &ctx, &path)).await {
		Ok(head) => head,
		Err(e) => {
			shared.client.release(conn, false).await;
			return Err(e);
		},
	};

	if upstream_head.status != StatusCode::SWITCHING_PROTOCOLS {
		let max_buffer = shared.max_body_buffer;
		let body = read_declined_body(&mut conn.socket, &upstream_head.headers, max_buffer).await;
		shared.client.release(conn, body.is_ok()).await;
		let body = body.unwrap_or_default();
		wire::write_response_head(client, upstream_head.status, &upstream_head.headers).await?;
		client.write_all(&body).await.map_err(|_| ProxyError::ClientAborted)?;
		return Ok(());
	}

	wire::write_response_head(client, upstream_head.status, &upstream_head.headers).await?;

	shared
		.middleware
		.run(Phase::AfterUpgrade, &mut ctx, &shared.middleware_budget)
		.await
		.ok();

	let result = if is_websocket_upgrade(&ctx.headers) && !shared.message_interceptors.is_empty() {
		super::ws::splice_with_interceptors(
			client,
			&mut conn.socket,
			shared.message_interceptors.clone(),
			shared.config.ws.close_timeout,
			shared.config.ws.max_message_size,
		)
		.await
	} else {
		copy_bidirectional(client, &mut conn.socket)
			.await
			.map(|_| ())
			.map_err(|_| ProxyError::UpstreamAborted)
	};
	shared.client.release(conn, false).await;
	result
}

/// Whether the negotiated upgrade is specifically WebSocket, as opposed to
/// some other `101`-switching protocol (spec §8 "Upstream sends 101 for a
/// non-WebSocket upgrade: forward verbatim and splice (generic tunnel)").
/// Only WebSocket upgrades are eligible for frame-level message
/// interception; anything else always gets a raw byte splice.
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
	headers
		.get(http::header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("websocket"))
		.unwrap_or(false)
}

async fn upstream_exchange(
	socket: &mut crate::transport::stream::Socket,
	ctx: &RequestContext,
	path: &str,
) -> Result<wire::ResponseHead, ProxyError> {
	wire::write_request_head(socket, &ctx.method, path, ctx.version, &ctx.headers).await?;
	wire::read_response_head(socket).await
}

async fn read_declined_body(
	socket: &mut crate::transport::stream::Socket,
	headers: &HeaderMap,
	max_buffer: usize,
) -> Result<Bytes, ProxyError> {
	match wire::framing_of(headers) {
		wire::BodyFraming::None => Ok(Bytes::new()),
		wire::BodyFraming::Length(len) => wire::read_length_body_to_bytes(socket, len, max_buffer).await,
		wire::BodyFraming::Chunked => {
			let mut buf = Vec::new();
			wire::copy_chunked_body(socket, &mut buf, false).await?;
			Ok(Bytes::from(buf))
		},
		wire::BodyFraming::UntilClose => {
			let mut buf = Vec::new();
			wire::copy_until_close(socket, &mut buf).await?;
			Ok(Bytes::from(buf))
		},
	}
}

async fn write_and_close<S: AsyncWrite + Unpin>(client: &mut S, resp: interceptor::ShortCircuitResponse) -> Result<(), ProxyError> {
	wire::write_response_head(client, resp.status, &resp.headers).await?;
	client.write_all(&resp.body).await.map_err(|_| ProxyError::ClientAborted)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn declined_body_framing_defaults_to_empty() {
		let headers = HeaderMap::new();
		assert_eq!(wire::framing_of(&headers), wire::BodyFraming::None);
	}

	#[test]
	fn recognizes_websocket_upgrade_case_insensitively() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::UPGRADE, http::HeaderValue::from_static("WebSocket"));
		assert!(is_websocket_upgrade(&headers));
	}

	#[test]
	fn non_websocket_upgrade_is_not_eligible_for_message_interception() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::UPGRADE, http::HeaderValue::from_static("h2c"));
		assert!(!is_websocket_upgrade(&headers));
	}
}
