use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

pin_project_lite::pin_project! {
	/// A client-side connection: either a plain TCP socket or a TLS-wrapped
	/// one. `Client` (module C/D) deals in this type so the connection pool
	/// and request pipeline don't need to know which transport a given
	/// origin uses.
	#[project = SocketProj]
	pub enum Socket {
		Plain { #[pin] inner: TcpStream },
		Tls { #[pin] inner: Box<tokio_rustls::client::TlsStream<TcpStream>> },
	}
}

impl Socket {
	pub fn plain(stream: TcpStream) -> Socket {
		Socket::Plain { inner: stream }
	}

	pub fn tls(stream: tokio_rustls::client::TlsStream<TcpStream>) -> Socket {
		Socket::Tls {
			inner: Box::new(stream),
		}
	}

	pub fn peer_addr(&self) -> io::Result<SocketAddr> {
		match self {
			Socket::Plain { inner } => inner.peer_addr(),
			Socket::Tls { inner } => inner.get_ref().0.peer_addr(),
		}
	}

	/// Best-effort liveness probe used by the connection pool on acquire:
	/// a socket whose peer has already closed will surface readiness with 0
	/// bytes available (spec §4.D "health-checked on acquire by testing
	/// writability").
	pub fn is_plausibly_alive(&self) -> bool {
		let raw = match self {
			Socket::Plain { inner } => inner,
			Socket::Tls { inner } => &inner.get_ref().0,
		};
		let mut buf = [0u8; 1];
		match raw.try_read(&mut buf) {
			Ok(0) => false,
			Ok(_) => true,
			Err(e) => e.kind() == io::ErrorKind::WouldBlock,
		}
	}
}

impl AsyncRead for Socket {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		match self.project() {
			SocketProj::Plain { inner } => inner.poll_read(cx, buf),
			SocketProj::Tls { inner } => inner.poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Socket {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.project() {
			SocketProj::Plain { inner } => inner.poll_write(cx, buf),
			SocketProj::Tls { inner } => inner.poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.project() {
			SocketProj::Plain { inner } => inner.poll_flush(cx),
			SocketProj::Tls { inner } => inner.poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.project() {
			SocketProj::Plain { inner } => inner.poll_shutdown(cx),
			SocketProj::Tls { inner } => inner.poll_shutdown(cx),
		}
	}
}

pin_project_lite::pin_project! {
	/// The accepted side of a connection once it may have been TLS-terminated
	/// for MITM (spec module H). Kept distinct from `Socket` because the
	/// server and client roles use different rustls stream types.
	#[project = ClientSocketProj]
	pub enum ClientSocket {
		Plain { #[pin] inner: TcpStream },
		Tls { #[pin] inner: Box<tokio_rustls::server::TlsStream<TcpStream>> },
	}
}

impl ClientSocket {
	pub fn plain(stream: TcpStream) -> ClientSocket {
		ClientSocket::Plain { inner: stream }
	}

	pub fn tls(stream: tokio_rustls::server::TlsStream<TcpStream>) -> ClientSocket {
		ClientSocket::Tls {
			inner: Box::new(stream),
		}
	}
}

impl AsyncRead for ClientSocket {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		match self.project() {
			ClientSocketProj::Plain { inner } => inner.poll_read(cx, buf),
			ClientSocketProj::Tls { inner } => inner.poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for ClientSocket {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.project() {
			ClientSocketProj::Plain { inner } => inner.poll_write(cx, buf),
			ClientSocketProj::Tls { inner } => inner.poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.project() {
			ClientSocketProj::Plain { inner } => inner.poll_flush(cx),
			ClientSocketProj::Tls { inner } => inner.poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.project() {
			ClientSocketProj::Plain { inner } => inner.poll_shutdown(cx),
			ClientSocketProj::Tls { inner } => inner.poll_shutdown(cx),
		}
	}
}
