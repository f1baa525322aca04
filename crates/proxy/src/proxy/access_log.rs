use std::time::Instant;

use http::{Method, StatusCode};
use uuid::Uuid;

/// What the request pipeline ultimately did with a request, for the access
/// log's `decision` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
	Forwarded,
	ShortCircuited,
	Tunnel,
	Mitm,
}

impl Decision {
	fn as_str(self) -> &'static str {
		match self {
			Decision::Forwarded => "forwarded",
			Decision::ShortCircuited => "short_circuited",
			Decision::Tunnel => "tunnel",
			Decision::Mitm => "mitm",
		}
	}
}

/// One structured log record per completed request/connection (spec
/// SPEC_FULL §10.A), mirroring the teacher's `RequestLog`/`DropOnLog` pair
/// in `proxy/tcpproxy.rs` without the CEL-expression machinery that record
/// carries there — this engine has no policy-expression layer, so the
/// fields are set directly and emitted as one `tracing::info!` on drop.
pub struct RequestLog {
	correlation_id: Uuid,
	method: Method,
	host: String,
	path: String,
	started_at: Instant,
	status: Option<StatusCode>,
	bytes_in: u64,
	bytes_out: u64,
	decision: Decision,
	error: Option<String>,
}

impl RequestLog {
	pub fn new(correlation_id: Uuid, method: Method, host: String, path: String, started_at: Instant) -> RequestLog {
		RequestLog {
			correlation_id,
			method,
			host,
			path,
			started_at,
			status: None,
			bytes_in: 0,
			bytes_out: 0,
			decision: Decision::Forwarded,
			error: None,
		}
	}

	pub fn set_status(&mut self, status: StatusCode) {
		self.status = Some(status);
	}

	pub fn set_bytes(&mut self, bytes_in: u64, bytes_out: u64) {
		self.bytes_in = bytes_in;
		self.bytes_out = bytes_out;
	}

	pub fn set_decision(&mut self, decision: Decision) {
		self.decision = decision;
	}

	pub fn set_error(&mut self, error: impl ToString) {
		self.error = Some(error.to_string());
	}
}

impl Drop for RequestLog {
	fn drop(&mut self) {
		tracing::info!(
			correlation_id = %self.correlation_id,
			method = %self.method,
			host = %self.host,
			path = %self.path,
			status = self.status.map(|s| s.as_u16()),
			bytes_in = self.bytes_in,
			bytes_out = self.bytes_out,
			duration_ms = self.started_at.elapsed().as_millis() as u64,
			decision = self.decision.as_str(),
			error = self.error.as_deref(),
			"request completed"
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decision_as_str_covers_every_variant() {
		assert_eq!(Decision::Forwarded.as_str(), "forwarded");
		assert_eq!(Decision::ShortCircuited.as_str(), "short_circuited");
		assert_eq!(Decision::Tunnel.as_str(), "tunnel");
		assert_eq!(Decision::Mitm.as_str(), "mitm");
	}

	#[test]
	fn fields_can_be_set_after_construction() {
		let mut log = RequestLog::new(Uuid::new_v4(), Method::GET, "example.test".into(), "/".into(), Instant::now());
		log.set_status(StatusCode::OK);
		log.set_bytes(10, 20);
		log.set_decision(Decision::ShortCircuited);
		log.set_error("boom");
		assert_eq!(log.status, Some(StatusCode::OK));
		assert_eq!(log.bytes_in, 10);
		assert_eq!(log.bytes_out, 20);
		assert_eq!(log.decision, Decision::ShortCircuited);
		assert_eq!(log.error.as_deref(), Some("boom"));
	}
}
