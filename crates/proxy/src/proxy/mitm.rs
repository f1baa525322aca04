use crate::config::MitmConfig;

/// Host-pattern matching for `mitm.include`/`mitm.exclude` (spec §6, §9 open
/// question "default MITM scope"). Patterns are `*` (match everything),
/// a bare host, or a `*.suffix` wildcard; exclude wins over include.
pub struct MitmPolicy {
	include: Vec<String>,
	exclude: Vec<String>,
}

impl MitmPolicy {
	pub fn new(config: &MitmConfig) -> MitmPolicy {
		MitmPolicy {
			include: config.include.clone(),
			exclude: config.exclude.clone(),
		}
	}

	pub fn allows(&self, host: &str) -> bool {
		let host = host.to_ascii_lowercase();
		if self.exclude.iter().any(|p| pattern_matches(p, &host)) {
			return false;
		}
		self.include.iter().any(|p| pattern_matches(p, &host))
	}
}

fn pattern_matches(pattern: &str, host: &str) -> bool {
	if pattern == "*" {
		return true;
	}
	let pattern = pattern.to_ascii_lowercase();
	if let Some(suffix) = pattern.strip_prefix("*.") {
		return host == suffix || host.ends_with(&format!(".{suffix}"));
	}
	pattern == host
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_matches_everything() {
		let policy = MitmPolicy::new(&MitmConfig::default());
		assert!(policy.allows("anything.test"));
	}

	#[test]
	fn exclude_wins_over_include() {
		let policy = MitmPolicy {
			include: vec!["*".to_string()],
			exclude: vec!["*.internal.test".to_string()],
		};
		assert!(policy.allows("example.test"));
		assert!(!policy.allows("secrets.internal.test"));
	}

	#[test]
	fn wildcard_pattern_matches_subdomains_and_bare_host() {
		let policy = MitmPolicy {
			include: vec!["*.example.test".to_string()],
			exclude: Vec::new(),
		};
		assert!(policy.allows("api.example.test"));
		assert!(policy.allows("example.test"));
		assert!(!policy.allows("other.test"));
	}
}
