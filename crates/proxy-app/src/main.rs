use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use relay_proxy::config::Config;
use relay_proxy::engine::Engine;
use relay_proxy::proxy::listener::Listener;

/// MITM HTTP/HTTPS/WebSocket forward proxy.
#[derive(Parser, Debug)]
#[command(name = "relay-proxy", version)]
struct Args {
	/// Path to a YAML config file (spec §6's config surface). Defaults are
	/// used for any key the file omits.
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Override `listen.host`/`listen.port` from the config file.
	#[arg(long)]
	listen: Option<String>,

	/// Override `ca.certPath`.
	#[arg(long)]
	ca_cert: Option<PathBuf>,

	/// Override `ca.keyPath`.
	#[arg(long)]
	ca_key: Option<PathBuf>,

	/// Log level, as a `tracing` filter directive (e.g. `info`, `debug`,
	/// `relay_proxy=trace`). Overridden by `RUST_LOG` when set.
	#[arg(long, default_value = "info")]
	log_level: String,

	/// Print the resolved config as YAML and exit, instead of serving.
	#[arg(long)]
	print_config: bool,

	/// Load (or generate) the CA, print its public certificate in PEM to
	/// stdout, and exit — for operators installing it in a client trust
	/// store (spec §4.A, §6 "CA material").
	#[arg(long)]
	print_ca_cert: bool,
}

#[tokio::main]
async fn main() {
	let args = Args::parse();
	init_tracing(&args.log_level);

	if let Err(e) = run(args).await {
		eprintln!("{e}");
		std::process::exit(1);
	}
}

fn init_tracing(log_level: &str) {
	use tracing_subscriber::EnvFilter;
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string())))
		.json()
		.init();
}

async fn run(args: Args) -> anyhow::Result<()> {
	let mut config = load_config(args.config.as_deref()).await?;
	apply_overrides(&mut config, &args);

	if args.print_config {
		println!("{}", serde_yaml::to_string(&config)?);
		return Ok(());
	}

	if args.print_ca_cert {
		let engine = relay_proxy::engine::Engine::new(config).await?;
		println!("{}", engine.ca_public_cert_pem());
		return Ok(());
	}

	tracing::info!(version = %relay_core::version::BuildInfo::new(), "starting relay-proxy");

	let engine = Arc::new(Engine::new(config.clone()).await?);

	let listener = Listener::bind(&config.listen.host, config.listen.port, engine.shared()).await?;
	tracing::info!(addr = %listener.local_addr()?, "listening");

	let (trigger, watcher) = relay_core::drain::new(config.drain_timeout, config.drain_timeout);

	let admin_task = config.admin.clone().map(|admin| {
		let engine = engine.clone();
		tokio::spawn(async move {
			if let Err(e) = relay_proxy::admin::serve(engine, &admin.host, admin.port).await {
				tracing::error!(error = %e, "admin surface failed");
			}
		})
	});

	let accept = tokio::spawn(listener.run(watcher));

	relay_core::signal::shutdown().await;
	tracing::info!("shutting down, draining in-flight connections");
	trigger.signal();
	let _ = accept.await;
	if tokio::time::timeout(config.drain_timeout, trigger.wait_for_drained())
		.await
		.is_err()
	{
		tracing::warn!("drain timeout elapsed, force-closing remaining connections");
	}
	if let Some(admin_task) = admin_task {
		admin_task.abort();
	}

	Ok(())
}

async fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
	let Some(path) = path else {
		return Ok(Config::default());
	};
	let contents = fs_err::tokio::read_to_string(path).await?;
	Ok(Config::from_yaml(&contents)?)
}

/// Applies CLI flag overrides onto a loaded config, in the precedence order a
/// CLI wrapper over a config file normally takes: explicit flags win over
/// whatever the file (or its defaults) set.
fn apply_overrides(config: &mut Config, args: &Args) {
	if let Some(listen) = &args.listen {
		if let Some((host, port)) = listen.rsplit_once(':') {
			if let Ok(port) = port.parse() {
				config.listen.host = host.to_string();
				config.listen.port = port;
			}
		}
	}
	if let Some(cert) = &args.ca_cert {
		config.ca.cert_path = Some(cert.to_string_lossy().into_owned());
	}
	if let Some(key) = &args.ca_key {
		config.ca.key_path = Some(key.to_string_lossy().into_owned());
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn args(listen: Option<&str>) -> Args {
		Args {
			config: None,
			listen: listen.map(str::to_string),
			ca_cert: None,
			ca_key: None,
			log_level: "info".to_string(),
			print_config: false,
			print_ca_cert: false,
		}
	}

	#[test]
	fn listen_override_splits_host_and_port() {
		let mut config = Config::default();
		apply_overrides(&mut config, &args(Some("127.0.0.1:9000")));
		assert_eq!(config.listen.host, "127.0.0.1");
		assert_eq!(config.listen.port, 9000);
	}

	#[test]
	fn no_listen_override_keeps_defaults() {
		let mut config = Config::default();
		let defaults = (config.listen.host.clone(), config.listen.port);
		apply_overrides(&mut config, &args(None));
		assert_eq!((config.listen.host, config.listen.port), defaults);
	}

	#[test]
	fn ca_paths_override_independently() {
		let mut config = Config::default();
		let mut a = args(None);
		a.ca_cert = Some(PathBuf::from("/tmp/ca.pem"));
		apply_overrides(&mut config, &a);
		assert_eq!(config.ca.cert_path.as_deref(), Some("/tmp/ca.pem"));
		assert!(config.ca.key_path.is_none());
	}
}
