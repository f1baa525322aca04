use tokio::signal::unix::{SignalKind, signal};

/// Resolves when the process receives SIGTERM or SIGINT (Ctrl-C). Used by the
/// binary's main loop to trigger a graceful drain.
pub async fn shutdown() {
	let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
	let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
	tokio::select! {
		_ = sigterm.recv() => tracing::info!("received SIGTERM"),
		_ = sigint.recv() => tracing::info!("received SIGINT"),
	}
}
