use std::net::SocketAddr;
use std::time::Instant;

use http::uri::Scheme;
use http::{Method, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use crate::client::dial::Destination;
use crate::error::ProxyError;
use crate::transport::stream::ClientSocket;
use crate::transport::tls::{extract_sni, looks_like_tls_handshake, server_config_for_leaf};
use relay_core::copy::copy_bidirectional;

use super::access_log::{Decision, RequestLog};
use super::pipeline;
use super::wire;
use super::ProxyShared;

/// A peek buffer large enough to hold a typical ClientHello's SNI extension;
/// CONNECT targets with unusually large ClientHellos (many ALPN protocols,
/// long session tickets) fall back to the CONNECT line's own host.
const SNI_PEEK_BYTES: usize = 4096;

/// Handles one accepted connection the listener identified as `CONNECT ...`
/// (spec module H). Establishes the tunnel, then decides TUNNEL vs MITM by
/// peeking the client's first bytes once the 200 response has been sent.
pub async fn handle(mut client: TcpStream, remote_addr: SocketAddr, shared: &ProxyShared) -> Result<(), ProxyError> {
	let head = wire::read_request_head(&mut client).await?;
	if head.method.as_str() != "CONNECT" {
		return Err(ProxyError::ProtocolViolation("expected CONNECT".into()));
	}
	let (host, port) = split_authority(&head.target)?;

	let started_at = Instant::now();
	let mut log = RequestLog::new(Uuid::new_v4(), Method::CONNECT, host.clone(), format!(":{port}"), started_at);

	client
		.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
		.await
		.map_err(|_| ProxyError::ClientAborted)?;
	log.set_status(StatusCode::OK);

	let mut peek_buf = vec![0u8; shared.config.peek_bytes.max(1)];
	let n = client.peek(&mut peek_buf).await.map_err(|_| ProxyError::ClientAborted)?;
	let wants_tls = looks_like_tls_handshake(&peek_buf[..n]);

	if wants_tls && shared.mitm_policy.allows(&host) {
		let mut sni_buf = vec![0u8; SNI_PEEK_BYTES];
		let n = client.peek(&mut sni_buf).await.map_err(|_| ProxyError::ClientAborted)?;
		let sni = extract_sni(&sni_buf[..n]).unwrap_or_else(|| host.clone());

		match shared.cert_store.leaf_for(&sni).await {
			Ok(leaf) => {
				log.set_decision(Decision::Mitm);
				let result = mitm(client, &leaf, remote_addr, shared).await;
				if let Err(ref e) = result {
					log.set_error(e.to_string());
				}
				return result;
			},
			Err(ProxyError::CertMintFailed(_)) => {
				// Degrade to a plain tunnel rather than failing the connection
				// outright (spec §4.H "CERT_MINT_FAILED ... fall back to TUNNEL").
			},
			Err(e) => {
				log.set_error(e.to_string());
				return Err(e);
			},
		}
	}

	log.set_decision(Decision::Tunnel);
	let result = tunnel(client, &host, port, shared).await;
	if let Err(ref e) = result {
		log.set_error(e.to_string());
	}
	result
}

async fn mitm(
	client: TcpStream,
	leaf: &crate::cert::LeafCert,
	remote_addr: SocketAddr,
	shared: &ProxyShared,
) -> Result<(), ProxyError> {
	let server_config = server_config_for_leaf(leaf)?;
	let acceptor = TlsAcceptor::from(server_config);
	let tls_stream = acceptor
		.accept(client)
		.await
		.map_err(|e| ProxyError::TlsHandshakeFailed(e.to_string()))?;
	let mut client_socket = ClientSocket::tls(tls_stream);
	pipeline::serve(&mut client_socket, Scheme::HTTPS, remote_addr, shared).await
}

async fn tunnel(mut client: TcpStream, host: &str, port: u16, shared: &ProxyShared) -> Result<(), ProxyError> {
	// Scheme::HTTP deliberately: the dialer must hand back a raw socket, not
	// a TLS-wrapped one, since tunneled bytes are the client's own encrypted
	// ClientHello and must pass through unmodified. This does mean a tunnel
	// to host:443 and a genuine plain HTTP request to the same host:port
	// would share a pool key; low risk in practice since CONNECT almost
	// always targets 443 while plain HTTP traffic targets 80.
	let dest = Destination::new(host, port, Scheme::HTTP);
	let request_uri: http::Uri = format!("http://{host}:{port}/")
		.parse()
		.map_err(|_| ProxyError::InvalidRequest)?;
	let mut conn = shared.client.acquire(&dest, &request_uri).await?;

	let result = copy_bidirectional(&mut client, &mut conn.socket).await;
	shared.client.release(conn, false).await;
	result.map(|_| ()).map_err(|_| ProxyError::UpstreamAborted)
}

fn split_authority(target: &str) -> Result<(String, u16), ProxyError> {
	let (host, port) = target
		.rsplit_once(':')
		.ok_or_else(|| ProxyError::ProtocolViolation(format!("CONNECT target missing port: {target}")))?;
	let port: u16 = port
		.parse()
		.map_err(|_| ProxyError::ProtocolViolation(format!("CONNECT target has invalid port: {target}")))?;
	Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn splits_host_and_port() {
		let (host, port) = split_authority("example.test:443").unwrap();
		assert_eq!(host, "example.test");
		assert_eq!(port, 443);
	}

	#[test]
	fn rejects_missing_port() {
		assert!(split_authority("example.test").is_err());
	}
}
