mod mint;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::Mutex as AsyncMutex;

use crate::ca::CertificateAuthority;
use crate::error::ProxyError;

/// A minted leaf certificate + key, value-typed per spec §4.B ("destroying
/// an entry does not invalidate already-handed-out copies").
#[derive(Clone)]
pub struct LeafCert {
	pub chain: Vec<CertificateDer<'static>>,
	pub key: PrivateKeyDer<'static>,
	pub not_after: std::time::SystemTime,
	pub sans: Vec<String>,
}

struct CacheEntry {
	leaf: LeafCert,
	/// Refreshed on every cache hit (direct or wildcard-covered), not just at
	/// insertion, so `evict_half_oldest` evicts by recency of use rather than
	/// by insertion order (spec §2/§3 "bounded LRU").
	last_used: Instant,
}

enum Lookup {
	Hit(LeafCert),
	Miss,
}

/// The per-host certificate mint & bounded LRU cache (spec module B).
///
/// A per-key async gate (`gates`) makes mint-on-miss single-flight: under
/// concurrent requests for the same uncached SNI, exactly one mints while
/// the rest wait on the same gate and then re-check the cache.
pub struct CertStore {
	ca: Arc<CertificateAuthority>,
	cache: Mutex<HashMap<String, CacheEntry>>,
	negative: Mutex<HashMap<String, Instant>>,
	gates: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
	max_size: usize,
	leaf_ttl: Duration,
	skew: Duration,
	negative_ttl: Duration,
}

impl CertStore {
	pub fn new(ca: Arc<CertificateAuthority>, max_size: usize, leaf_ttl: Duration, skew: Duration, negative_ttl: Duration) -> CertStore {
		CertStore {
			ca,
			cache: Mutex::new(HashMap::new()),
			negative: Mutex::new(HashMap::new()),
			gates: Mutex::new(HashMap::new()),
			max_size,
			leaf_ttl,
			skew,
			negative_ttl,
		}
	}

	/// `leafFor(sni) -> (cert, key)`. Normalizes the key, checks the cache
	/// (including wildcard coverage), and on miss mints under a per-key gate.
	pub async fn leaf_for(&self, requested_host: &str) -> Result<LeafCert, ProxyError> {
		let key = normalize_host(requested_host);

		if let Some(until) = self.negative.lock().get(&key).copied()
			&& Instant::now() < until
		{
			return Err(ProxyError::CertMintFailed(format!(
				"{key}: recent mint failure, suppressed for negative TTL"
			)));
		}

		if let Lookup::Hit(leaf) = self.lookup(&key) {
			return Ok(leaf);
		}

		let gate = {
			let mut gates = self.gates.lock();
			gates
				.entry(key.clone())
				.or_insert_with(|| Arc::new(AsyncMutex::new(())))
				.clone()
		};
		let _permit = gate.lock().await;

		// Re-check: another task may have minted while we waited for the gate.
		if let Lookup::Hit(leaf) = self.lookup(&key) {
			self.gates.lock().remove(&key);
			return Ok(leaf);
		}

		let result = mint::mint_leaf(&self.ca, &key, self.leaf_ttl, self.skew);
		self.gates.lock().remove(&key);

		match result {
			Ok(leaf) => {
				self.insert(key, leaf.clone());
				Ok(leaf)
			},
			Err(e) => {
				self
					.negative
					.lock()
					.insert(key, Instant::now() + self.negative_ttl);
				Err(e)
			},
		}
	}

	fn lookup(&self, key: &str) -> Lookup {
		{
			let mut cache = self.cache.lock();
			if let Some(entry) = cache.get_mut(key) {
				entry.last_used = Instant::now();
				return Lookup::Hit(entry.leaf.clone());
			}
		}
		// Wildcard coverage: a cached "*.example.com" leaf covers "api.example.com".
		if let Some(wildcard) = wildcard_of(key) {
			let mut cache = self.cache.lock();
			if let Some(entry) = cache.get_mut(&wildcard)
				&& entry.leaf.sans.iter().any(|s| s == key || s == &wildcard)
			{
				entry.last_used = Instant::now();
				return Lookup::Hit(entry.leaf.clone());
			}
		}
		Lookup::Miss
	}

	fn insert(&self, key: String, leaf: LeafCert) {
		let mut cache = self.cache.lock();
		cache.insert(
			key,
			CacheEntry {
				leaf,
				last_used: Instant::now(),
			},
		);
		if cache.len() > self.max_size {
			evict_least_recently_used_half(&mut cache);
		}
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.cache.lock().len()
	}
}

/// Batch eviction: drop the least-recently-used half rather than evicting
/// one entry per insertion past the threshold, which avoids thrashing right
/// at the boundary (spec §2/§3 "bounded LRU").
fn evict_least_recently_used_half(cache: &mut HashMap<String, CacheEntry>) {
	let mut by_recency: Vec<(String, Instant)> = cache
		.iter()
		.map(|(k, v)| (k.clone(), v.last_used))
		.collect();
	by_recency.sort_by_key(|(_, t)| *t);
	let to_evict = by_recency.len() / 2;
	for (key, _) in by_recency.into_iter().take(to_evict) {
		cache.remove(&key);
	}
}

/// Lowercase, strip port. Collapsing onto a wildcard form happens in
/// `lookup`/`wildcard_of`, not here, since the exact key is still needed to
/// check whether a previously-minted wildcard covers it.
pub fn normalize_host(host: &str) -> String {
	let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
	host.to_ascii_lowercase()
}

/// `api.x.com` -> `Some("*.x.com")`. Bare hosts with no subdomain (`x.com`)
/// and already-wildcard hosts (`*.x.com`) have no covering wildcard.
fn wildcard_of(host: &str) -> Option<String> {
	if host.starts_with("*.") {
		return None;
	}
	let (_, rest) = host.split_once('.')?;
	if rest.is_empty() || !rest.contains('.') {
		return None;
	}
	Some(format!("*.{rest}"))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn store() -> CertStore {
		let ca = Arc::new(CertificateAuthority::generate().unwrap());
		CertStore::new(
			ca,
			4,
			Duration::from_secs(3600),
			Duration::from_secs(60),
			Duration::from_secs(1),
		)
	}

	#[test]
	fn normalizes_case_and_port() {
		assert_eq!(normalize_host("Example.COM:8443"), "example.com");
	}

	#[test]
	fn wildcard_of_subdomain() {
		assert_eq!(wildcard_of("api.x.com"), Some("*.x.com".to_string()));
		assert_eq!(wildcard_of("x.com"), None);
		assert_eq!(wildcard_of("*.x.com"), None);
	}

	#[tokio::test]
	async fn mints_and_caches_a_leaf() {
		let store = store();
		let leaf = store.leaf_for("example.test").await.unwrap();
		assert!(leaf.sans.iter().any(|s| s == "example.test"));
		assert_eq!(store.len(), 1);
		let again = store.leaf_for("example.test").await.unwrap();
		assert_eq!(again.not_after, leaf.not_after);
	}

	#[tokio::test]
	async fn evicts_half_when_over_capacity() {
		let store = store();
		for i in 0..5 {
			store.leaf_for(&format!("h{i}.test")).await.unwrap();
		}
		assert!(store.len() <= 4);
	}

	#[tokio::test]
	async fn recently_used_entry_survives_eviction_ahead_of_a_stale_one() {
		let store = store();
		store.leaf_for("stale.test").await.unwrap();
		store.leaf_for("h1.test").await.unwrap();
		store.leaf_for("h2.test").await.unwrap();
		store.leaf_for("h3.test").await.unwrap();
		// Touch "stale.test" again so it is no longer the least-recently-used
		// entry, then push the cache over capacity.
		store.leaf_for("stale.test").await.unwrap();
		store.leaf_for("h4.test").await.unwrap();
		let cache = store.cache.lock();
		assert!(cache.contains_key("stale.test"));
	}

	#[tokio::test]
	async fn concurrent_requests_for_same_host_single_flight() {
		let store = Arc::new(store());
		let mut tasks = Vec::new();
		for _ in 0..8 {
			let store = store.clone();
			tasks.push(tokio::spawn(
				async move { store.leaf_for("shared.test").await.unwrap() },
			));
		}
		let mut leaves = Vec::new();
		for t in tasks {
			leaves.push(t.await.unwrap());
		}
		assert!(leaves.windows(2).all(|w| w[0].not_after == w[1].not_after));
		assert_eq!(store.len(), 1);
	}
}
