use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_listen_host() -> String {
	"0.0.0.0".to_string()
}
fn default_listen_port() -> u16 {
	8080
}
fn default_cache_size() -> usize {
	1024
}
fn default_leaf_ttl() -> Duration {
	Duration::from_secs(365 * 24 * 3600)
}
fn default_leaf_skew() -> Duration {
	Duration::from_secs(5 * 60)
}
fn default_negative_ttl() -> Duration {
	Duration::from_secs(30)
}
fn default_max_sockets() -> usize {
	32
}
fn default_max_free_sockets() -> usize {
	8
}
fn default_idle_timeout() -> Duration {
	Duration::from_secs(60)
}
fn default_wait_timeout() -> Duration {
	Duration::from_secs(5)
}
fn default_dial_timeout() -> Duration {
	Duration::from_secs(10)
}
fn default_middleware_timeout() -> Duration {
	Duration::from_secs(10)
}
fn default_middleware_max_concurrent() -> usize {
	100
}
fn default_interceptor_timeout() -> Duration {
	Duration::from_secs(10)
}
fn default_ws_close_timeout() -> Duration {
	Duration::from_secs(5)
}
fn default_ws_max_message_size() -> usize {
	16 * 1024 * 1024
}
fn default_max_body_buffer() -> usize {
	10 * 1024 * 1024
}
fn default_drain_timeout() -> Duration {
	Duration::from_secs(30)
}
fn default_mitm_include() -> Vec<String> {
	vec!["*".to_string()]
}
fn default_mitm_exclude() -> Vec<String> {
	Vec::new()
}
fn default_client_idle() -> Duration {
	Duration::from_secs(30)
}
fn default_ntlm_idle() -> Duration {
	Duration::from_secs(3600)
}
fn default_peek_bytes() -> usize {
	3
}

/// The engine's configuration surface, matching spec §6's table 1:1. This is
/// plain data: loading it from a file path, overlaying environment
/// variables, and watching it for changes are glue that live in the `app`
/// binary crate, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
	pub listen: ListenConfig,
	pub ca: CaConfig,
	pub cert: CertConfig,
	pub pool: PoolConfig,
	pub dial: DialConfig,
	/// Static upstream proxy URL (`http://` or `socks5://`), or empty for
	/// direct dialing. Per-request predicate upstream selection (spec §4.G
	/// step 4's "fns receive the request") is exposed as a Rust closure via
	/// `Engine::with_upstream_selector`, not as config data.
	#[serde(default)]
	pub upstream: Option<String>,
	pub middleware: MiddlewareConfig,
	pub interceptor: InterceptorConfig,
	pub mitm: MitmConfig,
	pub ws: WsConfig,
	#[serde(with = "humantime_serde_duration")]
	pub drain_timeout: Duration,
	#[serde(with = "humantime_serde_duration")]
	pub client_idle_timeout: Duration,
	#[serde(with = "humantime_serde_duration")]
	pub ntlm_idle_timeout: Duration,
	pub peek_bytes: usize,
	/// Off by default; binds a small read-only HTTP admin surface (spec §10.F).
	pub admin: Option<ListenConfig>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			listen: ListenConfig::default(),
			ca: CaConfig::default(),
			cert: CertConfig::default(),
			pool: PoolConfig::default(),
			dial: DialConfig::default(),
			upstream: None,
			middleware: MiddlewareConfig::default(),
			interceptor: InterceptorConfig::default(),
			mitm: MitmConfig::default(),
			ws: WsConfig::default(),
			drain_timeout: default_drain_timeout(),
			client_idle_timeout: default_client_idle(),
			ntlm_idle_timeout: default_ntlm_idle(),
			peek_bytes: default_peek_bytes(),
			admin: None,
		}
	}
}

impl Config {
	pub fn from_yaml(s: &str) -> Result<Config, serde_yaml::Error> {
		serde_yaml::from_str(s)
	}

	pub fn from_json(s: &str) -> Result<Config, serde_json::Error> {
		serde_json::from_str(s)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenConfig {
	pub host: String,
	pub port: u16,
}

impl Default for ListenConfig {
	fn default() -> Self {
		ListenConfig {
			host: default_listen_host(),
			port: default_listen_port(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CaConfig {
	pub cert_path: Option<String>,
	pub key_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertConfig {
	pub cache_size: usize,
	#[serde(with = "humantime_serde_duration")]
	pub leaf_ttl: Duration,
	#[serde(with = "humantime_serde_duration")]
	pub leaf_skew: Duration,
	#[serde(with = "humantime_serde_duration")]
	pub negative_ttl: Duration,
}

impl Default for CertConfig {
	fn default() -> Self {
		CertConfig {
			cache_size: default_cache_size(),
			leaf_ttl: default_leaf_ttl(),
			leaf_skew: default_leaf_skew(),
			negative_ttl: default_negative_ttl(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
	pub max_sockets: usize,
	pub max_free_sockets: usize,
	#[serde(with = "humantime_serde_duration")]
	pub idle_timeout: Duration,
	#[serde(with = "humantime_serde_duration")]
	pub wait_timeout: Duration,
}

impl Default for PoolConfig {
	fn default() -> Self {
		PoolConfig {
			max_sockets: default_max_sockets(),
			max_free_sockets: default_max_free_sockets(),
			idle_timeout: default_idle_timeout(),
			wait_timeout: default_wait_timeout(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DialConfig {
	#[serde(with = "humantime_serde_duration")]
	pub timeout: Duration,
}

impl Default for DialConfig {
	fn default() -> Self {
		DialConfig {
			timeout: default_dial_timeout(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MiddlewareConfig {
	#[serde(with = "humantime_serde_duration")]
	pub timeout: Duration,
	pub max_concurrent: usize,
}

impl Default for MiddlewareConfig {
	fn default() -> Self {
		MiddlewareConfig {
			timeout: default_middleware_timeout(),
			max_concurrent: default_middleware_max_concurrent(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InterceptorConfig {
	#[serde(with = "humantime_serde_duration")]
	pub timeout: Duration,
}

impl Default for InterceptorConfig {
	fn default() -> Self {
		InterceptorConfig {
			timeout: default_interceptor_timeout(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MitmConfig {
	pub include: Vec<String>,
	pub exclude: Vec<String>,
}

impl Default for MitmConfig {
	fn default() -> Self {
		MitmConfig {
			include: default_mitm_include(),
			exclude: default_mitm_exclude(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WsConfig {
	#[serde(with = "humantime_serde_duration")]
	pub close_timeout: Duration,
	pub max_message_size: usize,
}

impl Default for WsConfig {
	fn default() -> Self {
		WsConfig {
			close_timeout: default_ws_close_timeout(),
			max_message_size: default_ws_max_message_size(),
		}
	}
}

pub fn max_body_buffer() -> usize {
	default_max_body_buffer()
}

/// `serde_yaml`/`serde_json` don't special-case `std::time::Duration` the way
/// we want (seconds-as-float instead of a config-friendly integer), so we
/// serialize as whole milliseconds, matching the style of small inline
/// `with` modules seen throughout the teacher's config types.
mod humantime_serde_duration {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serialize, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		(d.as_millis() as u64).serialize(s)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let millis = u64::deserialize(d)?;
		Ok(Duration::from_millis(millis))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_spec_section_6() {
		let cfg = Config::default();
		assert_eq!(cfg.cert.cache_size, 1024);
		assert_eq!(cfg.cert.leaf_skew, Duration::from_secs(300));
		assert_eq!(cfg.pool.wait_timeout, Duration::from_secs(5));
		assert_eq!(cfg.dial.timeout, Duration::from_secs(10));
		assert_eq!(cfg.middleware.max_concurrent, 100);
		assert_eq!(cfg.mitm.include, vec!["*".to_string()]);
		assert!(cfg.mitm.exclude.is_empty());
		assert_eq!(cfg.ws.close_timeout, Duration::from_secs(5));
	}

	#[test]
	fn round_trips_through_yaml() {
		let cfg = Config::default();
		let yaml = serde_yaml::to_string(&cfg).unwrap();
		let back = Config::from_yaml(&yaml).unwrap();
		assert_eq!(back.listen.port, cfg.listen.port);
	}

	#[test]
	fn partial_yaml_falls_back_to_defaults() {
		let cfg = Config::from_yaml("listen:\n  port: 9999\n").unwrap();
		assert_eq!(cfg.listen.port, 9999);
		assert_eq!(cfg.listen.host, "0.0.0.0");
		assert_eq!(cfg.cert.cache_size, 1024);
	}
}
