use std::fmt;

/// Build-time version info, surfaced on `--version` and the admin `/healthz`
/// endpoint. Values come from `CARGO_PKG_VERSION` and `rustc`'s own version
/// string at compile time.
#[derive(Debug, Clone)]
pub struct BuildInfo {
	pub version: &'static str,
	pub rust_version: String,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: env!("CARGO_PKG_VERSION"),
			rust_version: rustc_version_runtime(),
		}
	}
}

impl Default for BuildInfo {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for BuildInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} (rustc {})", self.version, self.rust_version)
	}
}

fn rustc_version_runtime() -> String {
	option_env!("RUSTC_VERSION").unwrap_or("unknown").to_string()
}
