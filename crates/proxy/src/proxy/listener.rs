use std::net::SocketAddr;
use std::sync::Arc;

use http::uri::Scheme;
use tokio::net::{TcpListener, TcpStream};

use crate::error::ProxyError;
use crate::transport::stream::ClientSocket;
use relay_core::drain::DrainWatcher;

use super::connect;
use super::pipeline;
use super::ProxyShared;

/// The minimum prefix that distinguishes a CONNECT request from any other
/// HTTP method on the wire (spec §4.J "peek for the literal `CONNECT `
/// prefix"); every other method is shorter or differently-shaped.
const CONNECT_PREFIX: &[u8] = b"CONNECT ";

/// The accept loop (spec module J). Binds one TCP listener and spawns one
/// task per accepted connection, each of which peeks its first bytes to
/// decide whether it's a CONNECT tunnel (module H) or a plain HTTP/1.1
/// connection (module G, which itself hands off to module I on upgrade).
pub struct Listener {
	tcp: TcpListener,
	shared: Arc<ProxyShared>,
}

impl Listener {
	pub async fn bind(host: &str, port: u16, shared: Arc<ProxyShared>) -> Result<Listener, ProxyError> {
		let tcp = TcpListener::bind((host, port))
			.await
			.map_err(ProxyError::ListenerFailed)?;
		Ok(Listener { tcp, shared })
	}

	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.tcp.local_addr()
	}

	/// Accepts connections until `drain` has been signaled and its minimum
	/// grace period has elapsed, spawning one task per connection and
	/// bounding each task's remaining lifetime by the drain's hard deadline.
	pub async fn run(self, mut drain: DrainWatcher) {
		loop {
			tokio::select! {
				biased;
				_ = drain.drained_for_minimum() => break,
				accepted = self.tcp.accept() => {
					let Ok((stream, remote_addr)) = accepted else { continue };
					let shared = self.shared.clone();
					let mut conn_drain = drain.clone();
					tokio::spawn(async move {
						conn_drain.bound(serve_connection(stream, remote_addr, shared)).await;
					});
				}
			}
		}
	}
}

async fn serve_connection(stream: TcpStream, remote_addr: SocketAddr, shared: Arc<ProxyShared>) {
	let _ = stream.set_nodelay(true);
	let mut peek_buf = [0u8; 8];
	let n = match stream.peek(&mut peek_buf).await {
		Ok(n) => n,
		Err(_) => return,
	};

	let result = if n >= CONNECT_PREFIX.len() && &peek_buf[..CONNECT_PREFIX.len()] == CONNECT_PREFIX {
		connect::handle(stream, remote_addr, &shared).await
	} else {
		let mut socket = ClientSocket::plain(stream);
		pipeline::serve(&mut socket, Scheme::HTTP, remote_addr, &shared).await
	};

	if let Err(e) = result {
		tracing::debug!(kind = e.kind(), error = %e, %remote_addr, "connection ended");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn connect_prefix_is_eight_bytes() {
		assert_eq!(CONNECT_PREFIX, b"CONNECT ");
	}
}
