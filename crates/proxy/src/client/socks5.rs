use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::ProxyError;

/// Hand-written SOCKS5 client per RFC 1928, used by module C's SOCKS5 dial
/// policy. No crate in the corpus implements the wire format, so this
/// follows the RFC directly; only the `CONNECT` command and the two
/// authentication methods spec §6 calls out (no-auth, username/password)
/// are implemented — BIND and UDP ASSOCIATE are out of scope for a forward
/// proxy dialer.
pub async fn connect(
	stream: &mut TcpStream,
	target_host: &str,
	target_port: u16,
	credentials: Option<(&str, &str)>,
) -> Result<(), ProxyError> {
	greet(stream, credentials.is_some()).await?;
	if let Some((user, pass)) = credentials {
		authenticate(stream, user, pass).await?;
	}
	request_connect(stream, target_host, target_port).await
}

async fn greet(stream: &mut TcpStream, with_userpass: bool) -> Result<(), ProxyError> {
	let methods: &[u8] = if with_userpass { &[0x00, 0x02] } else { &[0x00] };
	let mut req = Vec::with_capacity(2 + methods.len());
	req.push(0x05); // protocol version
	req.push(methods.len() as u8);
	req.extend_from_slice(methods);
	stream
		.write_all(&req)
		.await
		.map_err(ProxyError::DialRefused)?;

	let mut resp = [0u8; 2];
	stream
		.read_exact(&mut resp)
		.await
		.map_err(ProxyError::DialRefused)?;
	if resp[0] != 0x05 {
		return Err(ProxyError::UpstreamProxyRejected(
			"SOCKS5 greeting: unexpected protocol version".into(),
		));
	}
	match resp[1] {
		0x00 if !with_userpass => Ok(()),
		0x02 if with_userpass => Ok(()),
		0xff => Err(ProxyError::UpstreamProxyRejected(
			"SOCKS5: no acceptable authentication method".into(),
		)),
		other => Err(ProxyError::UpstreamProxyRejected(format!(
			"SOCKS5: server selected unexpected method {other:#x}"
		))),
	}
}

async fn authenticate(stream: &mut TcpStream, user: &str, pass: &str) -> Result<(), ProxyError> {
	if user.len() > 255 || pass.len() > 255 {
		return Err(ProxyError::ProcessingString(
			"SOCKS5 username/password must each be <= 255 bytes".into(),
		));
	}
	let mut req = Vec::with_capacity(3 + user.len() + pass.len());
	req.push(0x01); // subnegotiation version
	req.push(user.len() as u8);
	req.extend_from_slice(user.as_bytes());
	req.push(pass.len() as u8);
	req.extend_from_slice(pass.as_bytes());
	stream
		.write_all(&req)
		.await
		.map_err(ProxyError::DialRefused)?;

	let mut resp = [0u8; 2];
	stream
		.read_exact(&mut resp)
		.await
		.map_err(ProxyError::DialRefused)?;
	if resp[1] != 0x00 {
		return Err(ProxyError::UpstreamProxyRejected(
			"SOCKS5 username/password authentication failed".into(),
		));
	}
	Ok(())
}

async fn request_connect(stream: &mut TcpStream, host: &str, port: u16) -> Result<(), ProxyError> {
	let mut req = vec![0x05, 0x01, 0x00]; // version, CONNECT, reserved
	match host.parse::<std::net::Ipv4Addr>() {
		Ok(ip) => {
			req.push(0x01); // IPv4
			req.extend_from_slice(&ip.octets());
		},
		Err(_) => match host.parse::<std::net::Ipv6Addr>() {
			Ok(ip) => {
				req.push(0x04); // IPv6
				req.extend_from_slice(&ip.octets());
			},
			Err(_) => {
				if host.len() > 255 {
					return Err(ProxyError::ProcessingString(
						"SOCKS5 domain name must be <= 255 bytes".into(),
					));
				}
				req.push(0x03); // domain name
				req.push(host.len() as u8);
				req.extend_from_slice(host.as_bytes());
			},
		},
	}
	req.extend_from_slice(&port.to_be_bytes());
	stream
		.write_all(&req)
		.await
		.map_err(ProxyError::DialRefused)?;

	let mut head = [0u8; 4];
	stream
		.read_exact(&mut head)
		.await
		.map_err(ProxyError::DialRefused)?;
	if head[0] != 0x05 {
		return Err(ProxyError::UpstreamProxyRejected(
			"SOCKS5 CONNECT reply: unexpected protocol version".into(),
		));
	}
	if head[1] != 0x00 {
		return Err(ProxyError::UpstreamProxyRejected(format!(
			"SOCKS5 CONNECT rejected with reply code {:#x}",
			head[1]
		)));
	}
	// Skip the bound address the server echoes back: we don't use it.
	let addr_len = match head[3] {
		0x01 => 4,
		0x04 => 16,
		0x03 => {
			let mut len = [0u8; 1];
			stream
				.read_exact(&mut len)
				.await
				.map_err(ProxyError::DialRefused)?;
			len[0] as usize
		},
		other => {
			return Err(ProxyError::ProtocolViolation(format!(
				"SOCKS5 CONNECT reply: unknown address type {other:#x}"
			)));
		},
	};
	let mut discard = vec![0u8; addr_len + 2]; // + bound port
	stream
		.read_exact(&mut discard)
		.await
		.map_err(ProxyError::DialRefused)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use tokio::net::TcpListener;

	use super::*;

	#[tokio::test]
	async fn connect_succeeds_against_a_minimal_fake_server() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		let server = tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.unwrap();
			let mut greeting = [0u8; 2];
			sock.read_exact(&mut greeting).await.unwrap();
			sock.write_all(&[0x05, 0x00]).await.unwrap();

			let mut head = [0u8; 4];
			sock.read_exact(&mut head).await.unwrap();
			let mut domain_len = [0u8; 1];
			sock.read_exact(&mut domain_len).await.unwrap();
			let mut rest = vec![0u8; domain_len[0] as usize + 2];
			sock.read_exact(&mut rest).await.unwrap();

			sock
				.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
				.await
				.unwrap();
		});

		let mut client = TcpStream::connect(addr).await.unwrap();
		connect(&mut client, "example.test", 80, None).await.unwrap();
		server.await.unwrap();
	}

	#[tokio::test]
	async fn nonzero_reply_is_upstream_proxy_rejected() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		let server = tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.unwrap();
			let mut greeting = [0u8; 2];
			sock.read_exact(&mut greeting).await.unwrap();
			sock.write_all(&[0x05, 0x00]).await.unwrap();

			let mut head = [0u8; 4];
			sock.read_exact(&mut head).await.unwrap();
			let mut domain_len = [0u8; 1];
			sock.read_exact(&mut domain_len).await.unwrap();
			let mut rest = vec![0u8; domain_len[0] as usize + 2];
			sock.read_exact(&mut rest).await.unwrap();

			// 0x05 = connection refused
			sock
				.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
				.await
				.unwrap();
		});

		let mut client = TcpStream::connect(addr).await.unwrap();
		let err = connect(&mut client, "example.test", 80, None)
			.await
			.unwrap_err();
		assert!(matches!(err, ProxyError::UpstreamProxyRejected(_)));
		server.await.unwrap();
	}
}
