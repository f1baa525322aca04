use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Byte counts for one direction of a spliced connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyResult {
	pub bytes: u64,
}

/// Splice two duplex streams until either side closes or errors, shutting
/// down the write half of each side once its read half reaches EOF.
///
/// This is the primitive behind CONNECT tunnels, TLS-terminated MITM tunnels
/// and WebSocket frame splicing: all three just wire different stream types
/// into this same bidirectional copy.
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> io::Result<(CopyResult, CopyResult)>
where
	A: AsyncRead + AsyncWrite + Unpin + ?Sized,
	B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
	let (mut ar, mut aw) = tokio::io::split(SplitShim(a));
	let (mut br, mut bw) = tokio::io::split(SplitShim(b));
	let a_to_b = async {
		let n = tokio::io::copy(&mut ar, &mut bw).await?;
		bw.shutdown().await?;
		Ok::<_, io::Error>(n)
	};
	let b_to_a = async {
		let n = tokio::io::copy(&mut br, &mut aw).await?;
		aw.shutdown().await?;
		Ok::<_, io::Error>(n)
	};
	let (a_to_b, b_to_a) = tokio::join!(a_to_b, b_to_a);
	Ok((
		CopyResult { bytes: a_to_b? },
		CopyResult { bytes: b_to_a? },
	))
}

// `tokio::io::split` requires `'static` ownership; callers of
// `copy_bidirectional` hold `&mut` streams instead, so we bridge through a
// thin shim rather than forcing every caller to box and own its streams.
struct SplitShim<'a, T: ?Sized>(&'a mut T);

impl<T: AsyncRead + Unpin + ?Sized> AsyncRead for SplitShim<'_, T> {
	fn poll_read(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &mut tokio::io::ReadBuf<'_>,
	) -> std::task::Poll<io::Result<()>> {
		std::pin::Pin::new(&mut *self.0).poll_read(cx, buf)
	}
}

impl<T: AsyncWrite + Unpin + ?Sized> AsyncWrite for SplitShim<'_, T> {
	fn poll_write(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &[u8],
	) -> std::task::Poll<io::Result<usize>> {
		std::pin::Pin::new(&mut *self.0).poll_write(cx, buf)
	}

	fn poll_flush(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<io::Result<()>> {
		std::pin::Pin::new(&mut *self.0).poll_flush(cx)
	}

	fn poll_shutdown(
		mut self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<io::Result<()>> {
		std::pin::Pin::new(&mut *self.0).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	#[tokio::test]
	async fn copies_both_directions_until_eof() {
		use tokio::io::AsyncReadExt;

		let (mut a, mut a_peer) = duplex(64);
		let (mut b, mut b_peer) = duplex(64);
		let driver = tokio::spawn(async move { copy_bidirectional(&mut a, &mut b).await.unwrap() });

		a_peer.write_all(b"ping").await.unwrap();
		let mut buf = [0u8; 4];
		b_peer.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"ping");

		b_peer.write_all(b"pong!").await.unwrap();
		let mut buf = [0u8; 5];
		a_peer.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"pong!");

		drop(a_peer);
		drop(b_peer);
		let (a_to_b, b_to_a) = driver.await.unwrap();
		assert_eq!(a_to_b.bytes, 4);
		assert_eq!(b_to_a.bytes, 5);
	}
}
