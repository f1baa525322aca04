pub mod dial;
pub mod pool;
mod socks5;

use std::sync::Arc;

use http::uri::Scheme;
use rustls::ClientConfig;
use url::Url;

use crate::config::Config;
use crate::error::ProxyError;
use crate::transport::tls::native_roots_client_config;
use dial::Destination;
use pool::{Pool, PoolKey, PooledConn};

/// How the dialer reaches a destination (spec §4.C).
#[derive(Debug, Clone)]
pub enum DialPolicy {
	Direct,
	HttpProxy(Url),
	Socks5(Url),
}

impl DialPolicy {
	/// A stable string distinguishing this policy for pool keying (spec §4.D
	/// "policyFingerprint"), without requiring `DialPolicy` itself to be
	/// `Hash`/`Eq` (it embeds a `Url`, whose equality semantics are looser
	/// than we want for a pool key).
	fn fingerprint(&self) -> String {
		match self {
			DialPolicy::Direct => "direct".to_string(),
			DialPolicy::HttpProxy(url) => format!("http_proxy:{}", url.origin().ascii_serialization()),
			DialPolicy::Socks5(url) => format!("socks5:{}", url.origin().ascii_serialization()),
		}
	}

	/// Parses the `upstream` config string (spec §6 `socks5://[user:pass@]host:port`
	/// or `http://host:port`), or `Direct` if none is configured.
	pub fn from_upstream_str(upstream: Option<&str>) -> Result<DialPolicy, ProxyError> {
		let Some(raw) = upstream.filter(|s| !s.is_empty()) else {
			return Ok(DialPolicy::Direct);
		};
		let url = Url::parse(raw)
			.map_err(|e| ProxyError::ConfigInvalid(format!("invalid upstream proxy url: {e}")))?;
		match url.scheme() {
			"http" => Ok(DialPolicy::HttpProxy(url)),
			"socks5" => Ok(DialPolicy::Socks5(url)),
			other => Err(ProxyError::ConfigInvalid(format!(
				"unsupported upstream proxy scheme: {other}"
			))),
		}
	}
}

/// Resolves the upstream-proxy selector against a request. Static strings are
/// used verbatim; a closure receives the request URI and target host so
/// callers can implement per-request routing (spec §4.G step 4 "fns receive
/// the request and return a URL or empty").
pub enum UpstreamSelector {
	None,
	Static(String),
	Dynamic(Arc<dyn Fn(&http::Uri) -> Option<String> + Send + Sync>),
}

impl UpstreamSelector {
	fn resolve(&self, uri: &http::Uri) -> Option<String> {
		match self {
			UpstreamSelector::None => None,
			UpstreamSelector::Static(s) => Some(s.clone()),
			UpstreamSelector::Dynamic(f) => f(uri),
		}
	}
}

/// Ties together the dialer (module C) and the connection pool (module D)
/// behind a single entry point the request pipeline calls.
pub struct Client {
	pool: Pool,
	tls_config: Arc<ClientConfig>,
	dial_timeout: std::time::Duration,
	upstream: UpstreamSelector,
}

impl Client {
	pub fn new(config: &Config) -> Result<Client, ProxyError> {
		Client::with_upstream_selector(config, UpstreamSelector::None)
	}

	pub fn with_upstream_selector(
		config: &Config,
		mut selector: UpstreamSelector,
	) -> Result<Client, ProxyError> {
		if matches!(selector, UpstreamSelector::None) {
			if let Some(upstream) = &config.upstream {
				selector = UpstreamSelector::Static(upstream.clone());
			}
		}
		Ok(Client {
			pool: Pool::new(config.pool.clone()),
			tls_config: native_roots_client_config()?,
			dial_timeout: config.dial.timeout,
			upstream: selector,
		})
	}

	/// Acquires a connection to `dest`, dialing fresh if the pool has none
	/// idle (spec §4.G step 5).
	pub async fn acquire(
		&self,
		dest: &Destination,
		request_uri: &http::Uri,
	) -> Result<PooledConn, ProxyError> {
		self.acquire_with_affinity(dest, request_uri, None).await
	}

	/// Like `acquire`, but `affinity` (when set) is folded into the pool key's
	/// fingerprint so every request carrying the same affinity id is pinned to
	/// a dedicated pool entry instead of sharing the origin's general pool
	/// (spec §4.J "this id is threaded to the upstream pool to guarantee
	/// connection affinity for the whole NTLM dance").
	pub async fn acquire_with_affinity(
		&self,
		dest: &Destination,
		request_uri: &http::Uri,
		affinity: Option<&str>,
	) -> Result<PooledConn, ProxyError> {
		let policy = match self.upstream.resolve(request_uri) {
			Some(raw) => DialPolicy::from_upstream_str(Some(&raw))?,
			None => DialPolicy::Direct,
		};
		let fingerprint = match affinity {
			Some(id) => format!("{}+ntlm:{id}", policy.fingerprint()),
			None => policy.fingerprint(),
		};
		let key = PoolKey::new(dest.scheme.as_str(), dest.host.clone(), dest.port, fingerprint);
		let tls_config = self.tls_config.clone();
		let dial_timeout = self.dial_timeout;
		let dest = dest.clone();
		self
			.pool
			.acquire(&key, || async move {
				dial::dial(&dest, &policy, &tls_config, dial_timeout).await
			})
			.await
	}

	pub async fn release(&self, conn: PooledConn, healthy: bool) {
		self.pool.release(conn, healthy).await;
	}

	pub async fn destroy_all(&self, keys: impl IntoIterator<Item = PoolKey>) {
		for key in keys {
			self.pool.destroy(&key).await;
		}
	}

	pub fn counters(&self, key: &PoolKey) -> Option<pool::PoolCountersSnapshot> {
		self.pool.counters(key)
	}

	pub fn all_counters(&self) -> Vec<(PoolKey, pool::PoolCountersSnapshot)> {
		self.pool.all_counters()
	}
}

pub fn scheme_from_str(scheme: &str) -> Scheme {
	if scheme.eq_ignore_ascii_case("https") {
		Scheme::HTTPS
	} else {
		Scheme::HTTP
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_upstream_str_none_is_direct() {
		assert!(matches!(
			DialPolicy::from_upstream_str(None).unwrap(),
			DialPolicy::Direct
		));
	}

	#[test]
	fn from_upstream_str_parses_http_and_socks5() {
		assert!(matches!(
			DialPolicy::from_upstream_str(Some("http://proxy.test:8080")).unwrap(),
			DialPolicy::HttpProxy(_)
		));
		assert!(matches!(
			DialPolicy::from_upstream_str(Some("socks5://proxy.test:1080")).unwrap(),
			DialPolicy::Socks5(_)
		));
	}

	#[test]
	fn unsupported_scheme_is_config_invalid() {
		let err = DialPolicy::from_upstream_str(Some("ftp://proxy.test")).unwrap_err();
		assert!(matches!(err, ProxyError::ConfigInvalid(_)));
	}

	#[test]
	fn fingerprint_distinguishes_direct_from_proxied() {
		let direct = DialPolicy::Direct;
		let proxied = DialPolicy::HttpProxy(Url::parse("http://proxy.test:8080").unwrap());
		assert_ne!(direct.fingerprint(), proxied.fingerprint());
	}

	#[tokio::test]
	async fn distinct_affinity_ids_dial_separate_pool_entries() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let accepts = tokio::spawn(async move {
			for _ in 0..2 {
				let (sock, _) = listener.accept().await.unwrap();
				std::mem::forget(sock);
			}
		});

		let client = Client::new(&Config::default()).unwrap();
		let dest = Destination::new(addr.ip().to_string(), addr.port(), Scheme::HTTP);
		let uri: http::Uri = format!("http://{addr}/").parse().unwrap();

		let plain = client.acquire_with_affinity(&dest, &uri, None).await.unwrap();
		let ntlm = client.acquire_with_affinity(&dest, &uri, Some("conn-1")).await.unwrap();
		assert_ne!(plain.key(), ntlm.key());
		accepts.await.unwrap();
	}
}
