use std::net::SocketAddr;
use std::pin::Pin;
use std::task::Poll;
use std::time::Instant;

use bytes::Bytes;
use http::uri::Scheme;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::dial::Destination;
use crate::error::ProxyError;
use crate::interceptor::{self, ApplyOverrides, ChainOutcome, ForwardOverrides};
use crate::middleware::{self, MiddlewareOutcome, Phase};

use super::access_log::{Decision, RequestLog};
use super::wire;
use super::ProxyShared;

/// Headers that describe one specific hop and must never be forwarded
/// verbatim (RFC 7230 §6.1), mirroring the upstream-proxy's own hop-by-hop
/// stripping so a relayed request never leaks connection-management state
/// from the client's leg onto the server's leg. `Transfer-Encoding` is
/// deliberately absent: it describes the body's own framing, not a hop, and
/// must survive stripping so an unmodified chunked body can be relayed with
/// its announcing header intact (spec §8 transparent-forward law).
const HOP_HEADERS: &[HeaderName] = &[
	http::header::CONNECTION,
	http::header::PROXY_AUTHENTICATE,
	http::header::PROXY_AUTHORIZATION,
	http::header::TE,
	http::header::TRAILER,
	http::header::UPGRADE,
];

pub(super) fn strip_hop_by_hop(headers: &mut HeaderMap) {
	for name in HOP_HEADERS {
		headers.remove(name);
	}
	headers.remove("proxy-connection");
	headers.remove("keep-alive");
}

/// Per-request state threaded through the middleware and interceptor chains
/// for the plain HTTP pipeline (spec module G). The method/target/headers/
/// body fields double as the mutable "forward plan": interceptors mutate
/// them in place via `apply_overrides` rather than building a separate
/// shadow copy.
pub struct RequestContext {
	pub method: Method,
	pub target_uri: Uri,
	pub version: Version,
	pub headers: HeaderMap,
	/// The request body, populated only once it has actually been read into
	/// memory — either because an interceptor declared it needs to see/
	/// replace one (spec §5), or because `apply_overrides` replaced it
	/// outright. Empty and meaningless while `request_body_framing` is not
	/// `None`; the real bytes still sit unread on the client socket then.
	pub body: Bytes,
	/// How to relay the request body straight from the client socket to the
	/// upstream one without buffering it, or `None` once the body has been
	/// consumed (buffered into `body`, replaced by an override, or drained
	/// after a short circuit that never forwarded it).
	pub request_body_framing: wire::BodyFraming,
	pub scheme: Scheme,
	pub remote_addr: SocketAddr,
	pub correlation_id: Uuid,
	pub started_at: Instant,
	pub cancellation: CancellationToken,
	pub stopped: bool,
	pub intercepted: bool,
	pub short_circuit: Option<interceptor::ShortCircuitResponse>,
	pub response_status: Option<StatusCode>,
	pub response_headers: HeaderMap,
	pub response_body: Bytes,
	/// Set once this client connection has sent an `Authorization` header,
	/// pinning every subsequent request on the connection to the same
	/// upstream pool entry (spec §4.J NTLM connection affinity).
	pub affinity: Option<String>,
}

fn apply_header_overrides(headers: &mut HeaderMap, overrides: Option<Vec<(String, Option<String>)>>) {
	let Some(overrides) = overrides else { return };
	for (name, value) in overrides {
		let Ok(name) = HeaderName::try_from(name) else {
			continue;
		};
		match value {
			Some(v) => {
				if let Ok(v) = HeaderValue::from_str(&v) {
					headers.insert(name, v);
				}
			},
			None => {
				headers.remove(name);
			},
		}
	}
}

impl ApplyOverrides for RequestContext {
	fn apply_overrides(&mut self, phase: Phase, overrides: ForwardOverrides) {
		self.intercepted = true;
		match phase {
			Phase::BeforeResponse | Phase::AfterResponse => {
				if let Some(body) = overrides.body {
					self.response_body = body;
				}
				apply_header_overrides(&mut self.response_headers, overrides.headers);
			},
			_ => {
				if let Some(method) = overrides.method {
					self.method = method;
				}
				if let Some(url) = overrides.url {
					self.target_uri = url;
				}
				if let Some(body) = overrides.body {
					self.body = body;
					// The override supplies the whole body; nothing is left
					// to stream off the client socket anymore.
					self.request_body_framing = wire::BodyFraming::None;
				}
				apply_header_overrides(&mut self.headers, overrides.headers);
			},
		}
	}
}

/// Parses the request-target into an absolute `Uri`, handling both
/// absolute-form (`GET http://host/path HTTP/1.1`, the classic proxy form)
/// and origin-form (`GET /path HTTP/1.1` with a `Host` header, the form seen
/// after MITM TLS termination).
pub(super) fn resolve_target_uri(target: &str, headers: &HeaderMap, default_scheme: &Scheme) -> Result<Uri, ProxyError> {
	let uri: Uri = target
		.parse()
		.map_err(|_| ProxyError::InvalidRequest)?;
	if uri.authority().is_some() {
		return Ok(uri);
	}
	let host = headers
		.get(http::header::HOST)
		.and_then(|v| v.to_str().ok())
		.ok_or(ProxyError::InvalidRequest)?;
	let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
	Uri::builder()
		.scheme(default_scheme.clone())
		.authority(host)
		.path_and_query(path)
		.build()
		.map_err(|_| ProxyError::InvalidRequest)
}

pub(super) fn destination_from_uri(uri: &Uri) -> Result<Destination, ProxyError> {
	let authority = uri.authority().ok_or(ProxyError::InvalidRequest)?;
	let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
	let port = authority
		.port_u16()
		.unwrap_or(if scheme == Scheme::HTTPS { 443 } else { 80 });
	Ok(Destination::new(authority.host(), port, scheme))
}

/// Reads a full body of the given `framing` into memory, bounded by
/// `max_buffer` (spec §4.G step 5 / §5 `BODY_TOO_LARGE`). Only called once
/// the pipeline has already decided buffering is necessary — an unmodified
/// body is relayed with `relay_body` instead and never hits this bound.
async fn read_body<R: AsyncRead + Unpin>(r: &mut R, framing: wire::BodyFraming, max_buffer: usize) -> Result<Bytes, ProxyError> {
	match framing {
		wire::BodyFraming::None => Ok(Bytes::new()),
		wire::BodyFraming::Length(len) => wire::read_length_body_to_bytes(r, len, max_buffer).await,
		wire::BodyFraming::Chunked => {
			let mut buf = Vec::new();
			wire::copy_chunked_body(r, &mut buf, false).await?;
			if buf.len() > max_buffer {
				return Err(ProxyError::BodyTooLarge);
			}
			Ok(Bytes::from(buf))
		},
		wire::BodyFraming::UntilClose => {
			let mut buf = Vec::new();
			wire::copy_until_close(r, &mut buf).await?;
			if buf.len() > max_buffer {
				return Err(ProxyError::BodyTooLarge);
			}
			Ok(Bytes::from(buf))
		},
	}
}

/// Relays a body of the given `framing` from `r` to `w` unread and
/// unbuffered, preserving whatever delimiter the source used (spec §8
/// "transparent-forward law": length stays length, chunked stays chunked,
/// until-close stays until-close). `forward_trailers` mirrors
/// `wire::copy_chunked_body`'s own flag.
async fn relay_body<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
	r: &mut R,
	w: &mut W,
	framing: wire::BodyFraming,
	forward_trailers: bool,
) -> Result<u64, ProxyError> {
	match framing {
		wire::BodyFraming::None => Ok(0),
		wire::BodyFraming::Length(len) => wire::copy_length_body(r, w, len).await,
		wire::BodyFraming::Chunked => wire::copy_chunked_body(r, w, forward_trailers).await,
		wire::BodyFraming::UntilClose => wire::copy_until_close(r, w).await,
	}
}

/// Discards a not-yet-consumed body of the given `framing`, used when a
/// short circuit decides the request or response without ever forwarding
/// the real body — reading and throwing it away keeps the connection's
/// framing consistent for whoever reads the socket next instead of leaving
/// stray bytes behind.
async fn drain_body<R: AsyncRead + Unpin>(r: &mut R, framing: wire::BodyFraming) -> Result<(), ProxyError> {
	relay_body(r, &mut tokio::io::sink(), framing, false).await.map(|_| ())
}

fn default_error_response(err: &ProxyError) -> Option<(StatusCode, Bytes)> {
	err.status_code().map(|status| (status, Bytes::from(err.to_string())))
}

/// A best-effort "has the client given up" probe: polls a single byte off
/// the client socket without consuming the rest of its buffer. `Ready` means
/// either EOF (the client closed its half) or a genuine read error; either
/// way the caller treats it as "the client is gone". Generalizes the
/// connection pool's `Socket::is_plausibly_alive` liveness check (a 1-byte
/// non-blocking read) to an arbitrary `AsyncRead`, since the client side of
/// the pipeline is generic over `ClientSocket` rather than the pool's
/// concrete `Socket` type. A client that legitimately pipelines a second
/// request while the first is still being relayed can have that request's
/// first byte consumed by this probe and lost; this is a known, accepted
/// limitation given HTTP pipelining is rarely used by real clients.
pub(super) async fn watch_client_closed<S: AsyncRead + Unpin>(client: &mut S) -> ProxyError {
	let mut byte = 0u8;
	std::future::poll_fn(|cx| {
		let mut slice = [0u8];
		let mut buf = ReadBuf::new(&mut slice);
		match Pin::new(&mut *client).poll_read(cx, &mut buf) {
			Poll::Ready(Ok(())) => {
				byte = buf.filled().first().copied().unwrap_or(0);
				Poll::Ready(())
			},
			Poll::Ready(Err(_)) => Poll::Ready(()),
			Poll::Pending => Poll::Pending,
		}
	})
	.await;
	let _ = byte;
	ProxyError::ClientAborted
}

/// Races `fut` against the client half closing, cancelling `cancellation`
/// and returning `ClientAborted` the moment the client goes away (spec §5
/// cancellation propagation / §4.G "closing the client half aborts the
/// upstream half"). Every suspending upstream operation in `run_exchange`
/// and `upgrade::handle` goes through this so the upstream connection is
/// never left waiting on a client that has already disappeared.
pub(super) async fn with_cancellation<S, Fut, T>(client: &mut S, cancellation: &CancellationToken, fut: Fut) -> Result<T, ProxyError>
where
	S: AsyncRead + Unpin,
	Fut: std::future::Future<Output = Result<T, ProxyError>>,
{
	if cancellation.is_cancelled() {
		return Err(ProxyError::ClientAborted);
	}
	tokio::select! {
		biased;
		result = fut => result,
		reason = watch_client_closed(client) => {
			cancellation.cancel();
			Err(reason)
		},
	}
}

/// Runs one request/response exchange read from `client` over `shared`,
/// returning whether the client connection should stay open for another
/// request (spec §4.G, keep-alive negotiated per RFC 7230 §6.3).
pub async fn run_request<S: AsyncRead + AsyncWrite + Unpin>(
	client: &mut S,
	scheme: Scheme,
	remote_addr: SocketAddr,
	shared: &ProxyShared,
) -> Result<bool, ProxyError> {
	let head = wire::read_request_head(client).await?;
	run_request_with_head(head, client, scheme, remote_addr, shared, None).await
}

/// Whether a just-read request line wants a protocol upgrade (spec §4.I
/// "a request is an upgrade request iff it carries `Connection: Upgrade`").
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
	headers
		.get(http::header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("upgrade"))
		.unwrap_or(false)
}

/// Serves one already-parsed request head (spec §4.G steps 2-7). Split out
/// from `run_request` so callers that need to branch on the request line
/// before committing to the HTTP pipeline — the upgrade path in particular —
/// can read the head once and route it themselves.
pub async fn run_request_with_head<S: AsyncRead + AsyncWrite + Unpin>(
	head: wire::RequestHead,
	client: &mut S,
	scheme: Scheme,
	remote_addr: SocketAddr,
	shared: &ProxyShared,
	affinity: Option<String>,
) -> Result<bool, ProxyError> {
	let mut headers = head.headers;
	let client_wants_close = connection_wants_close(&headers, head.version);
	let request_body_framing = wire::framing_of(&headers);
	strip_hop_by_hop(&mut headers);

	let target_uri = resolve_target_uri(&head.target, &headers, &scheme)?;
	let started_at = Instant::now();
	let correlation_id = Uuid::new_v4();
	let mut log = RequestLog::new(
		correlation_id,
		head.method.clone(),
		target_uri.host().unwrap_or_default().to_string(),
		target_uri.path().to_string(),
		started_at,
	);

	let mut ctx = RequestContext {
		method: head.method,
		target_uri,
		version: head.version,
		headers,
		body: Bytes::new(),
		request_body_framing,
		scheme,
		remote_addr,
		correlation_id,
		started_at,
		cancellation: CancellationToken::new(),
		stopped: false,
		intercepted: false,
		short_circuit: None,
		response_status: None,
		response_headers: HeaderMap::new(),
		response_body: Bytes::new(),
		affinity,
	};

	let outcome = run_exchange(&mut ctx, client, shared, client_wants_close, &mut log).await;
	log.set_decision(if ctx.intercepted {
		Decision::ShortCircuited
	} else {
		Decision::Forwarded
	});

	match outcome {
		Ok(keep_alive) => Ok(keep_alive),
		Err(ProxyError::ClientAborted) | Err(ProxyError::UpstreamAborted) => {
			log.set_error("connection aborted");
			Ok(false)
		},
		Err(e) => match default_error_response(&e) {
			Some((status, body)) => {
				log.set_error(e.to_string());
				let mut response_headers = HeaderMap::new();
				response_headers.insert(
					http::header::CONTENT_LENGTH,
					HeaderValue::from_str(&body.len().to_string()).expect("decimal digits are valid header value bytes"),
				);
				// An error mid-exchange may have left the request or response
				// body partially relayed; closing avoids guessing whether the
				// connection's framing is still sound for a reused request.
				response_headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
				log.set_status(status);
				log.set_bytes(0, body.len() as u64);
				wire::write_response_head(client, status, &response_headers).await?;
				client.write_all(&body).await.map_err(|_| ProxyError::ClientAborted)?;
				Ok(false)
			},
			None => Err(e),
		},
	}
}

/// Serves an accepted connection until the client closes it or a request
/// asks to upgrade, in which case control passes to module I. Used by the
/// plain listener path and, identically, by the post-MITM-TLS-termination
/// path (spec §4.G/§4.I both read off whatever transport the listener or
/// CONNECT state machine handed them).
pub async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
	client: &mut S,
	scheme: Scheme,
	remote_addr: SocketAddr,
	shared: &ProxyShared,
) -> Result<(), ProxyError> {
	// Per-connection NTLM affinity state (spec §4.J): once a request on this
	// connection carries `Authorization`, every later request gets pinned to
	// the same upstream pool entry via a connection-local id, and the client
	// idle timeout widens from its default to `ntlm_idle_timeout` for the
	// rest of the NTLM handshake.
	let mut affinity: Option<String> = None;
	loop {
		let idle_timeout = if affinity.is_some() {
			shared.config.ntlm_idle_timeout
		} else {
			shared.config.client_idle_timeout
		};
		let head = match tokio::time::timeout(idle_timeout, wire::read_request_head(client)).await {
			Ok(Ok(head)) => head,
			Ok(Err(ProxyError::UpstreamAborted)) => return Ok(()),
			Ok(Err(e)) => return Err(e),
			Err(_elapsed) => return Ok(()),
		};
		if starts_ntlm_affinity(affinity.is_some(), &head.headers) {
			affinity = Some(Uuid::new_v4().to_string());
		}
		if is_upgrade_request(&head.headers) {
			return super::upgrade::handle(head, client, scheme, remote_addr, shared).await;
		}
		match run_request_with_head(head, client, scheme, remote_addr, shared, affinity.clone()).await {
			Ok(true) => continue,
			Ok(false) => return Ok(()),
			Err(ProxyError::ClientAborted) | Err(ProxyError::UpstreamAborted) => return Ok(()),
			Err(e) => return Err(e),
		}
	}
}

/// Whether this request should start (or continue) NTLM connection affinity
/// for the rest of the client connection (spec §4.J: triggered by the first
/// `Authorization` header seen, sticky for every later request).
fn starts_ntlm_affinity(already_affine: bool, headers: &HeaderMap) -> bool {
	!already_affine && headers.contains_key(http::header::AUTHORIZATION)
}

fn connection_wants_close(headers: &HeaderMap, version: Version) -> bool {
	let connection = headers
		.get(http::header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
		.to_ascii_lowercase();
	if connection.contains("close") {
		return true;
	}
	if version == Version::HTTP_10 {
		return !connection.contains("keep-alive");
	}
	false
}

/// Finishes an exchange that was decided by a short circuit (the request
/// never reached an upstream, or the real upstream response was replaced),
/// writing `ctx`'s response fields to `client` and returning the usual
/// keep-alive bool.
async fn finish_with_short_circuit<S: AsyncWrite + Unpin>(
	ctx: &mut RequestContext,
	client: &mut S,
	client_wants_close: bool,
	log: &mut RequestLog,
) -> Result<bool, ProxyError> {
	ctx.stopped = true;
	let status = ctx.response_status.unwrap_or(StatusCode::BAD_GATEWAY);
	let mut response_headers = std::mem::take(&mut ctx.response_headers);
	strip_hop_by_hop(&mut response_headers);
	response_headers.insert(
		http::header::CONTENT_LENGTH,
		HeaderValue::from_str(&ctx.response_body.len().to_string()).expect("decimal digits are valid header value bytes"),
	);
	response_headers.remove(http::header::TRANSFER_ENCODING);
	if client_wants_close {
		response_headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
	}
	log.set_status(status);
	log.set_bytes(0, ctx.response_body.len() as u64);
	wire::write_response_head(client, status, &response_headers).await?;
	client
		.write_all(&ctx.response_body)
		.await
		.map_err(|_| ProxyError::ClientAborted)?;
	Ok(!client_wants_close)
}

fn apply_short_circuit(ctx: &mut RequestContext, resp: interceptor::ShortCircuitResponse) {
	ctx.response_status = Some(resp.status);
	ctx.response_headers = resp.headers;
	ctx.response_body = resp.body;
}

/// The body of the pipeline once a `RequestContext` is built: middleware,
/// interceptors, dial, upstream exchange, and the matching response-side
/// phases. A body (request or response) is only ever buffered into memory
/// when a registered interceptor declared it wants to see/replace one (spec
/// §5 backpressure); otherwise it is relayed straight through with its
/// original framing preserved, and every upstream-suspending step races the
/// client half closing so a vanished client never leaves the upstream
/// connection dangling.
async fn run_exchange<S: AsyncRead + AsyncWrite + Unpin>(
	ctx: &mut RequestContext,
	client: &mut S,
	shared: &ProxyShared,
	client_wants_close: bool,
	log: &mut RequestLog,
) -> Result<bool, ProxyError> {
	if shared.interceptor.phase_wants_body(Phase::BeforeRequest) && ctx.request_body_framing != wire::BodyFraming::None {
		ctx.body = with_cancellation(
			client,
			&ctx.cancellation,
			read_body(client, ctx.request_body_framing, shared.max_body_buffer),
		)
		.await?;
		ctx.request_body_framing = wire::BodyFraming::None;
	}

	shared
		.middleware
		.run(Phase::BeforeRequest, ctx, &shared.middleware_budget)
		.await?;

	if let ChainOutcome::ShortCircuit(resp) = shared
		.interceptor
		.run(Phase::BeforeRequest, ctx, &shared.interceptor_budget)
		.await?
	{
		if ctx.request_body_framing != wire::BodyFraming::None {
			drain_body(client, ctx.request_body_framing).await.ok();
			ctx.request_body_framing = wire::BodyFraming::None;
		}
		apply_short_circuit(ctx, resp);
		shared
			.middleware
			.run(Phase::AfterRequest, ctx, &shared.middleware_budget)
			.await
			.ok();
		return finish_with_short_circuit(ctx, client, client_wants_close, log).await;
	}

	let dest = destination_from_uri(&ctx.target_uri)?;
	let path = ctx
		.target_uri
		.path_and_query()
		.map(|p| p.as_str())
		.unwrap_or("/")
		.to_string();

	let mut conn = with_cancellation(
		client,
		&ctx.cancellation,
		shared.client.acquire_with_affinity(&dest, &ctx.target_uri, ctx.affinity.as_deref()),
	)
	.await?;

	let forward_trailers = ctx.headers.contains_key(http::header::TRAILER);
	let write_result = with_cancellation(client, &ctx.cancellation, async {
		wire::write_request_head(&mut conn.socket, &ctx.method, &path, ctx.version, &ctx.headers).await?;
		if ctx.request_body_framing != wire::BodyFraming::None {
			relay_body(client, &mut conn.socket, ctx.request_body_framing, forward_trailers).await?;
		} else if !ctx.body.is_empty() {
			conn
				.socket
				.write_all(&ctx.body)
				.await
				.map_err(|_| ProxyError::UpstreamAborted)?;
		}
		Ok(())
	})
	.await;
	if let Err(e) = write_result {
		shared.client.release(conn, false).await;
		return Err(e);
	}

	let head = match with_cancellation(client, &ctx.cancellation, wire::read_response_head(&mut conn.socket)).await {
		Ok(head) => head,
		Err(e) => {
			shared.client.release(conn, false).await;
			return Err(e);
		},
	};
	ctx.response_status = Some(head.status);
	ctx.response_headers = head.headers;
	let response_framing = wire::response_body_framing(&ctx.method, head.status, &ctx.response_headers);

	shared
		.middleware
		.run(Phase::AfterRequest, ctx, &shared.middleware_budget)
		.await?;

	if shared.interceptor.phase_wants_body(Phase::BeforeResponse) {
		let body = match with_cancellation(client, &ctx.cancellation, read_body(&mut conn.socket, response_framing, shared.max_body_buffer)).await {
			Ok(body) => body,
			Err(e) => {
				shared.client.release(conn, false).await;
				return Err(e);
			},
		};
		ctx.response_body = body;
		// The real response body has been fully consumed, so the connection
		// is safe to reuse regardless of what happens next.
		shared.client.release(conn, true).await;

		if let ChainOutcome::ShortCircuit(resp) = shared
			.interceptor
			.run(Phase::BeforeResponse, ctx, &shared.interceptor_budget)
			.await?
		{
			apply_short_circuit(ctx, resp);
			shared
				.middleware
				.run(Phase::AfterResponse, ctx, &shared.middleware_budget)
				.await
				.ok();
			return finish_with_short_circuit(ctx, client, client_wants_close, log).await;
		}
		shared
			.middleware
			.run(Phase::BeforeResponse, ctx, &shared.middleware_budget)
			.await?;
		shared
			.middleware
			.run(Phase::AfterResponse, ctx, &shared.middleware_budget)
			.await?;

		return finish_with_short_circuit(ctx, client, client_wants_close, log).await;
	}

	if let ChainOutcome::ShortCircuit(resp) = shared
		.interceptor
		.run(Phase::BeforeResponse, ctx, &shared.interceptor_budget)
		.await?
	{
		// The real upstream body still sits unread on this connection; it
		// cannot be safely returned to the pool for a future request.
		shared.client.release(conn, false).await;
		apply_short_circuit(ctx, resp);
		shared
			.middleware
			.run(Phase::AfterResponse, ctx, &shared.middleware_budget)
			.await
			.ok();
		return finish_with_short_circuit(ctx, client, client_wants_close, log).await;
	}
	shared
		.middleware
		.run(Phase::BeforeResponse, ctx, &shared.middleware_budget)
		.await?;
	shared
		.middleware
		.run(Phase::AfterResponse, ctx, &shared.middleware_budget)
		.await?;

	let status = ctx.response_status.unwrap_or(StatusCode::BAD_GATEWAY);
	let mut response_headers = std::mem::take(&mut ctx.response_headers);
	strip_hop_by_hop(&mut response_headers);
	if client_wants_close {
		response_headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
	}
	let forward_response_trailers = response_headers.contains_key(http::header::TRAILER);
	if let Err(e) = wire::write_response_head(client, status, &response_headers).await {
		shared.client.release(conn, false).await;
		return Err(e);
	}
	let bytes_out = match relay_body(&mut conn.socket, client, response_framing, forward_response_trailers).await {
		Ok(n) => n,
		Err(e) => {
			shared.client.release(conn, false).await;
			log.set_error(e.to_string());
			return Err(e);
		},
	};
	shared.client.release(conn, true).await;

	log.set_status(status);
	log.set_bytes(0, bytes_out);
	Ok(!client_wants_close)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strip_hop_by_hop_removes_connection_and_keep_alive() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive"));
		headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
		headers.insert(http::header::HOST, HeaderValue::from_static("example.test"));
		strip_hop_by_hop(&mut headers);
		assert!(!headers.contains_key(http::header::CONNECTION));
		assert!(!headers.contains_key("keep-alive"));
		assert!(headers.contains_key(http::header::HOST));
	}

	#[test]
	fn strip_hop_by_hop_preserves_transfer_encoding() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
		strip_hop_by_hop(&mut headers);
		assert!(headers.contains_key(http::header::TRANSFER_ENCODING));
	}

	#[test]
	fn resolve_target_uri_handles_absolute_form() {
		let headers = HeaderMap::new();
		let uri = resolve_target_uri("http://example.test/foo", &headers, &Scheme::HTTP).unwrap();
		assert_eq!(uri.host(), Some("example.test"));
		assert_eq!(uri.path(), "/foo");
	}

	#[test]
	fn resolve_target_uri_handles_origin_form_via_host_header() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::HOST, HeaderValue::from_static("example.test"));
		let uri = resolve_target_uri("/foo", &headers, &Scheme::HTTPS).unwrap();
		assert_eq!(uri.scheme(), Some(&Scheme::HTTPS));
		assert_eq!(uri.host(), Some("example.test"));
	}

	#[test]
	fn origin_form_without_host_header_is_invalid() {
		let headers = HeaderMap::new();
		let err = resolve_target_uri("/foo", &headers, &Scheme::HTTP).unwrap_err();
		assert!(matches!(err, ProxyError::InvalidRequest));
	}

	#[test]
	fn connection_close_header_forces_close() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
		assert!(connection_wants_close(&headers, Version::HTTP_11));
	}

	#[test]
	fn http10_without_keep_alive_closes_by_default() {
		let headers = HeaderMap::new();
		assert!(connection_wants_close(&headers, Version::HTTP_10));
	}

	#[test]
	fn authorization_header_starts_ntlm_affinity() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("NTLM abcd"));
		assert!(starts_ntlm_affinity(false, &headers));
	}

	#[test]
	fn already_affine_connection_does_not_restart() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("NTLM abcd"));
		assert!(!starts_ntlm_affinity(true, &headers));
	}

	#[test]
	fn no_authorization_header_does_not_start_affinity() {
		let headers = HeaderMap::new();
		assert!(!starts_ntlm_affinity(false, &headers));
	}

	#[tokio::test]
	async fn relay_body_preserves_chunked_framing_byte_for_byte() {
		let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
		let mut cursor = std::io::Cursor::new(raw.to_vec());
		let mut out = Vec::new();
		let n = relay_body(&mut cursor, &mut out, wire::BodyFraming::Chunked, false).await.unwrap();
		assert_eq!(n, 9);
		assert_eq!(out, raw);
	}

	#[tokio::test]
	async fn relay_body_preserves_length_framing() {
		let raw = b"hello".to_vec();
		let mut cursor = std::io::Cursor::new(raw.clone());
		let mut out = Vec::new();
		relay_body(&mut cursor, &mut out, wire::BodyFraming::Length(5), false).await.unwrap();
		assert_eq!(out, raw);
	}

	#[tokio::test]
	async fn drain_body_discards_bytes_without_erroring() {
		let raw = b"hello".to_vec();
		let mut cursor = std::io::Cursor::new(raw);
		drain_body(&mut cursor, wire::BodyFraming::Length(5)).await.unwrap();
	}

	#[tokio::test]
	async fn watch_client_closed_resolves_on_eof() {
		let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
		let err = watch_client_closed(&mut cursor).await;
		assert!(matches!(err, ProxyError::ClientAborted));
	}

	#[tokio::test]
	async fn with_cancellation_returns_inner_result_when_client_stays_open() {
		// A cursor over a single placeholder byte never reaches EOF mid-poll
		// because `with_cancellation` only polls `watch_client_closed` once
		// the inner future is pending; an already-ready inner future wins.
		let mut client = tokio::io::duplex(4).0;
		let cancellation = CancellationToken::new();
		let result: Result<u32, ProxyError> = with_cancellation(&mut client, &cancellation, async { Ok(7) }).await;
		assert_eq!(result.unwrap(), 7);
		assert!(!cancellation.is_cancelled());
	}

	#[tokio::test]
	async fn with_cancellation_cancels_token_when_client_closes_first() {
		let (client_half, server_half) = tokio::io::duplex(4);
		drop(server_half);
		let mut client_half = client_half;
		let cancellation = CancellationToken::new();
		let never = std::future::pending::<Result<(), ProxyError>>();
		let result = with_cancellation(&mut client_half, &cancellation, never).await;
		assert!(matches!(result, Err(ProxyError::ClientAborted)));
		assert!(cancellation.is_cancelled());
	}
}
