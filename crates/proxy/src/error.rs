use http::StatusCode;

/// The kinds surfaced in logs/metrics per the error taxonomy. Not every kind
/// produces a client-visible response (`CLIENT_ABORTED`, `UPSTREAM_ABORTED`
/// tear the connection down with no response at all; `CERT_MINT_FAILED`
/// degrades the CONNECT state machine to a tunnel instead of failing).
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("invalid configuration: {0}")]
	ConfigInvalid(String),
	#[error("certificate authority not loaded")]
	CaNotLoaded,
	#[error("listener failed: {0}")]
	ListenerFailed(std::io::Error),

	#[error("dial timed out")]
	DialTimeout,
	#[error("dial refused: {0}")]
	DialRefused(std::io::Error),
	#[error("upstream proxy rejected the request: {0}")]
	UpstreamProxyRejected(String),

	#[error("connection pool exhausted")]
	PoolExhausted,
	#[error("overloaded")]
	Overload,

	#[error("TLS handshake failed: {0}")]
	TlsHandshakeFailed(String),
	#[error("certificate mint failed: {0}")]
	CertMintFailed(String),

	#[error("middleware {name} timed out")]
	MiddlewareTimeout { name: String },
	#[error("interceptor {name} timed out")]
	InterceptorTimeout { name: String },

	#[error("client aborted the request")]
	ClientAborted,
	#[error("upstream aborted the request")]
	UpstreamAborted,

	#[error("protocol violation: {0}")]
	ProtocolViolation(String),
	#[error("body too large")]
	BodyTooLarge,

	#[error("invalid request")]
	InvalidRequest,
	#[error("DNS resolution failed")]
	DnsResolution,
	#[error("upstream call failed: {0}")]
	UpstreamCallFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
	#[error("{0}")]
	Processing(#[source] anyhow::Error),
	#[error("{0}")]
	ProcessingString(String),
}

impl ProxyError {
	/// True for start-time errors that should abort the process rather than
	/// fail a single request.
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			ProxyError::ConfigInvalid(_) | ProxyError::CaNotLoaded | ProxyError::ListenerFailed(_)
		)
	}

	/// Maps the error kind to the status code shown to the client, per §7. A
	/// `None` means no response is sent at all (the connection is simply
	/// torn down).
	pub fn status_code(&self) -> Option<StatusCode> {
		match self {
			ProxyError::ConfigInvalid(_) | ProxyError::CaNotLoaded | ProxyError::ListenerFailed(_) => {
				None
			},
			ProxyError::DialTimeout
			| ProxyError::DialRefused(_)
			| ProxyError::UpstreamProxyRejected(_)
			| ProxyError::UpstreamCallFailed(_)
			| ProxyError::DnsResolution => Some(StatusCode::BAD_GATEWAY),
			ProxyError::PoolExhausted | ProxyError::Overload => Some(StatusCode::SERVICE_UNAVAILABLE),
			ProxyError::TlsHandshakeFailed(_) => Some(StatusCode::BAD_GATEWAY),
			ProxyError::CertMintFailed(_) => None,
			ProxyError::MiddlewareTimeout { .. } | ProxyError::InterceptorTimeout { .. } => {
				Some(StatusCode::INTERNAL_SERVER_ERROR)
			},
			ProxyError::ClientAborted | ProxyError::UpstreamAborted => None,
			ProxyError::ProtocolViolation(_) => Some(StatusCode::BAD_REQUEST),
			ProxyError::BodyTooLarge => Some(StatusCode::PAYLOAD_TOO_LARGE),
			ProxyError::InvalidRequest => Some(StatusCode::BAD_REQUEST),
			ProxyError::Processing(_) | ProxyError::ProcessingString(_) => {
				Some(StatusCode::INTERNAL_SERVER_ERROR)
			},
		}
	}

	/// The short taxonomy name used in logs, e.g. `"DIAL_TIMEOUT"`.
	pub fn kind(&self) -> &'static str {
		match self {
			ProxyError::ConfigInvalid(_) => "CONFIG_INVALID",
			ProxyError::CaNotLoaded => "CA_NOT_LOADED",
			ProxyError::ListenerFailed(_) => "LISTENER_FAILED",
			ProxyError::DialTimeout => "DIAL_TIMEOUT",
			ProxyError::DialRefused(_) => "DIAL_REFUSED",
			ProxyError::UpstreamProxyRejected(_) => "UPSTREAM_PROXY_REJECTED",
			ProxyError::PoolExhausted => "POOL_EXHAUSTED",
			ProxyError::Overload => "OVERLOAD",
			ProxyError::TlsHandshakeFailed(_) => "TLS_HANDSHAKE_FAILED",
			ProxyError::CertMintFailed(_) => "CERT_MINT_FAILED",
			ProxyError::MiddlewareTimeout { .. } => "MIDDLEWARE_TIMEOUT",
			ProxyError::InterceptorTimeout { .. } => "INTERCEPTOR_TIMEOUT",
			ProxyError::ClientAborted => "CLIENT_ABORTED",
			ProxyError::UpstreamAborted => "UPSTREAM_ABORTED",
			ProxyError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
			ProxyError::BodyTooLarge => "BODY_TOO_LARGE",
			ProxyError::InvalidRequest | ProxyError::DnsResolution => "PROTOCOL_VIOLATION",
			ProxyError::UpstreamCallFailed(_) => "DIAL_REFUSED",
			ProxyError::Processing(_) | ProxyError::ProcessingString(_) => "PROTOCOL_VIOLATION",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fatal_kinds_have_no_status_code() {
		assert!(ProxyError::CaNotLoaded.status_code().is_none());
		assert!(ProxyError::CaNotLoaded.is_fatal());
	}

	#[test]
	fn dial_timeout_maps_to_502() {
		assert_eq!(
			ProxyError::DialTimeout.status_code(),
			Some(StatusCode::BAD_GATEWAY)
		);
	}

	#[test]
	fn cert_mint_failed_has_no_client_response() {
		assert!(ProxyError::CertMintFailed("boom".into()).status_code().is_none());
		assert!(!ProxyError::CertMintFailed("boom".into()).is_fatal());
	}
}
