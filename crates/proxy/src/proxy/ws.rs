use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

/// The direction a frame travelled, passed to a `MessageInterceptor` so it
/// can tell client→upstream traffic from upstream→client traffic (spec
/// module I "deliver per-message callbacks").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	ClientToUpstream,
	UpstreamToClient,
}

/// The WebSocket opcodes relevant to splicing (RFC 6455 §5.2). Reserved
/// opcodes are forwarded untouched like control frames; this engine never
/// needs to construct or interpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
	Continuation,
	Text,
	Binary,
	Close,
	Ping,
	Pong,
	Other(u8),
}

impl Opcode {
	fn from_u8(b: u8) -> Opcode {
		match b {
			0x0 => Opcode::Continuation,
			0x1 => Opcode::Text,
			0x2 => Opcode::Binary,
			0x8 => Opcode::Close,
			0x9 => Opcode::Ping,
			0xA => Opcode::Pong,
			other => Opcode::Other(other),
		}
	}

	fn as_u8(self) -> u8 {
		match self {
			Opcode::Continuation => 0x0,
			Opcode::Text => 0x1,
			Opcode::Binary => 0x2,
			Opcode::Close => 0x8,
			Opcode::Ping => 0x9,
			Opcode::Pong => 0xA,
			Opcode::Other(b) => b,
		}
	}

	fn is_control(self) -> bool {
		matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong) || matches!(self, Opcode::Other(b) if b & 0x8 != 0)
	}
}

/// One complete message reassembled from a data frame plus any continuation
/// frames (spec module I "Continuation frames are reassembled before
/// callback").
pub struct Message {
	pub opcode: Opcode,
	pub payload: Bytes,
}

/// What a message interceptor decided about one reassembled message.
pub enum MessageAction {
	Forward(Bytes),
	Drop,
}

/// Delivers per-message callbacks for data frames crossing a spliced
/// WebSocket connection. Control frames never reach this trait — they are
/// forwarded untouched per spec module I.
#[async_trait::async_trait]
pub trait MessageInterceptor: Send + Sync {
	fn name(&self) -> &str;
	async fn on_message(&self, direction: Direction, message: &Message) -> MessageAction;
}

/// Copy-on-write registry of message interceptors, the same pattern as
/// `middleware::Chain`/`interceptor::Chain` (spec §5 registry concurrency)
/// but unordered: message interceptors have no priority field in the spec,
/// they simply all run in registration order.
pub struct MessageInterceptors {
	entries: ArcSwap<Vec<Arc<dyn MessageInterceptor>>>,
}

impl MessageInterceptors {
	pub fn new() -> MessageInterceptors {
		MessageInterceptors {
			entries: ArcSwap::from_pointee(Vec::new()),
		}
	}

	pub fn register(&self, interceptor: Arc<dyn MessageInterceptor>) {
		self.entries.rcu(|current| {
			let mut next: Vec<Arc<dyn MessageInterceptor>> =
				current.iter().filter(|e| e.name() != interceptor.name()).cloned().collect();
			next.push(interceptor.clone());
			Arc::new(next)
		});
	}

	pub fn is_empty(&self) -> bool {
		self.entries.load().is_empty()
	}

	async fn run(&self, direction: Direction, message: &Message) -> MessageAction {
		let entries = self.entries.load();
		let mut payload = message.payload.clone();
		let mut dropped = false;
		for entry in entries.iter() {
			let current = Message {
				opcode: message.opcode,
				payload: payload.clone(),
			};
			match entry.on_message(direction, &current).await {
				MessageAction::Forward(p) => payload = p,
				MessageAction::Drop => {
					dropped = true;
					break;
				},
			}
		}
		if dropped {
			MessageAction::Drop
		} else {
			MessageAction::Forward(payload)
		}
	}
}

const MAX_HEADER_BYTES: usize = 14; // 2 base + 8 extended length + 4 mask key

struct RawFrame {
	fin: bool,
	opcode: Opcode,
	masked: bool,
	mask_key: [u8; 4],
	payload: BytesMut,
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, max_message_size: usize) -> Result<RawFrame, ProxyError> {
	let mut first2 = [0u8; 2];
	r.read_exact(&mut first2).await.map_err(io_to_proxy_error)?;
	let fin = first2[0] & 0x80 != 0;
	let opcode = Opcode::from_u8(first2[0] & 0x0F);
	let masked = first2[1] & 0x80 != 0;
	let len7 = first2[1] & 0x7F;

	let len: u64 = match len7 {
		126 => {
			let mut buf = [0u8; 2];
			r.read_exact(&mut buf).await.map_err(io_to_proxy_error)?;
			u16::from_be_bytes(buf) as u64
		},
		127 => {
			let mut buf = [0u8; 8];
			r.read_exact(&mut buf).await.map_err(io_to_proxy_error)?;
			u64::from_be_bytes(buf)
		},
		n => n as u64,
	};

	if len as usize > max_message_size {
		return Err(ProxyError::BodyTooLarge);
	}

	let mut mask_key = [0u8; 4];
	if masked {
		r.read_exact(&mut mask_key).await.map_err(io_to_proxy_error)?;
	}

	let mut payload = BytesMut::zeroed(len as usize);
	r.read_exact(&mut payload).await.map_err(io_to_proxy_error)?;
	if masked {
		for (i, b) in payload.iter_mut().enumerate() {
			*b ^= mask_key[i % 4];
		}
	}

	Ok(RawFrame {
		fin,
		opcode,
		masked,
		mask_key,
		payload,
	})
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, fin: bool, opcode: Opcode, masked: bool, mask_key: [u8; 4], payload: &[u8]) -> Result<(), ProxyError> {
	let mut header = Vec::with_capacity(MAX_HEADER_BYTES);
	let first_byte = (if fin { 0x80 } else { 0 }) | opcode.as_u8();
	header.push(first_byte);

	let mask_bit = if masked { 0x80 } else { 0 };
	if payload.len() < 126 {
		header.push(mask_bit | payload.len() as u8);
	} else if payload.len() <= u16::MAX as usize {
		header.push(mask_bit | 126);
		header.extend_from_slice(&(payload.len() as u16).to_be_bytes());
	} else {
		header.push(mask_bit | 127);
		header.extend_from_slice(&(payload.len() as u64).to_be_bytes());
	}
	if masked {
		header.extend_from_slice(&mask_key);
	}

	w.write_all(&header).await.map_err(io_to_proxy_error)?;
	if masked {
		let mut masked_payload = payload.to_vec();
		for (i, b) in masked_payload.iter_mut().enumerate() {
			*b ^= mask_key[i % 4];
		}
		w.write_all(&masked_payload).await.map_err(io_to_proxy_error)?;
	} else {
		w.write_all(payload).await.map_err(io_to_proxy_error)?;
	}
	w.flush().await.map_err(io_to_proxy_error)
}

fn io_to_proxy_error(_e: std::io::Error) -> ProxyError {
	ProxyError::UpstreamAborted
}

/// One direction of a message-aware splice: reads complete messages
/// (reassembling continuation frames) off `from`, runs them through
/// `interceptors`, and writes the result to `to`. Control frames pass
/// through with their opcode and payload untouched — masking direction
/// (client frames are masked, server frames are not) is preserved on the
/// way out by re-using whatever masking bit the original frame carried.
async fn pump<R, W>(
	mut from: R,
	mut to: W,
	direction: Direction,
	interceptors: Arc<MessageInterceptors>,
	max_message_size: usize,
) -> Result<(), ProxyError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut pending: Option<(Opcode, BytesMut)> = None;
	loop {
		let frame = read_frame(&mut from, max_message_size).await?;

		if frame.opcode.is_control() {
			write_frame(&mut to, frame.fin, frame.opcode, frame.masked, frame.mask_key, &frame.payload).await?;
			if frame.opcode == Opcode::Close {
				return Ok(());
			}
			continue;
		}

		let (opcode, mut buf) = match (frame.opcode, pending.take()) {
			(Opcode::Continuation, Some((opcode, mut buf))) => {
				buf.extend_from_slice(&frame.payload);
				(opcode, buf)
			},
			(Opcode::Continuation, None) => return Err(ProxyError::ProtocolViolation("continuation with no prior frame".into())),
			(opcode, _) => (opcode, frame.payload),
		};

		if buf.len() > max_message_size {
			return Err(ProxyError::BodyTooLarge);
		}

		if !frame.fin {
			pending = Some((opcode, buf));
			continue;
		}

		let message = Message {
			opcode,
			payload: buf.freeze(),
		};
		match interceptors.run(direction, &message).await {
			MessageAction::Forward(payload) => {
				write_frame(&mut to, true, opcode, frame.masked, frame.mask_key, &payload).await?;
			},
			MessageAction::Drop => {},
		}
	}
}

/// Splices two already-upgraded WebSocket connections frame-by-frame,
/// delivering per-message callbacks through `interceptors` (spec module I
/// step 4). Closes both directions once either side sends or forwards a
/// close frame, waiting up to `close_timeout` for the peer's own close
/// before tearing the connection down regardless.
pub async fn splice_with_interceptors<C, U>(
	client: &mut C,
	upstream: &mut U,
	interceptors: Arc<MessageInterceptors>,
	close_timeout: Duration,
	max_message_size: usize,
) -> Result<(), ProxyError>
where
	C: AsyncRead + AsyncWrite + Unpin,
	U: AsyncRead + AsyncWrite + Unpin,
{
	let (client_r, client_w) = tokio::io::split(&mut *client);
	let (upstream_r, upstream_w) = tokio::io::split(&mut *upstream);

	let mut c2u = Box::pin(pump(client_r, upstream_w, Direction::ClientToUpstream, interceptors.clone(), max_message_size));
	let mut u2c = Box::pin(pump(upstream_r, client_w, Direction::UpstreamToClient, interceptors, max_message_size));

	// Whichever direction finishes first (typically on forwarding a close
	// frame) determines the result; the other side gets `close_timeout` to
	// notice the close and wind down on its own before we give up on it
	// (spec module I "wait up to closeTimeout for the peer's close, then
	// tear down both sides").
	let first = tokio::select! {
		result = &mut c2u => result,
		result = &mut u2c => result,
	};
	let _ = tokio::time::timeout(close_timeout, async {
		tokio::select! {
			_ = &mut c2u => {},
			_ = &mut u2c => {},
		}
	})
	.await;
	first
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	struct Upper;
	#[async_trait::async_trait]
	impl MessageInterceptor for Upper {
		fn name(&self) -> &str {
			"upper"
		}
		async fn on_message(&self, _direction: Direction, message: &Message) -> MessageAction {
			let upper = String::from_utf8_lossy(&message.payload).to_uppercase();
			MessageAction::Forward(Bytes::from(upper))
		}
	}

	struct Dropper;
	#[async_trait::async_trait]
	impl MessageInterceptor for Dropper {
		fn name(&self) -> &str {
			"dropper"
		}
		async fn on_message(&self, _direction: Direction, _message: &Message) -> MessageAction {
			MessageAction::Drop
		}
	}

	#[tokio::test]
	async fn round_trips_a_single_text_frame() {
		let (mut a, mut b) = duplex(256);
		write_frame(&mut a, true, Opcode::Text, false, [0; 4], b"hello").await.unwrap();
		let frame = read_frame(&mut b, 1 << 20).await.unwrap();
		assert_eq!(frame.opcode, Opcode::Text);
		assert_eq!(&frame.payload[..], b"hello");
	}

	#[tokio::test]
	async fn masked_frame_unmasks_on_read() {
		let (mut a, mut b) = duplex(256);
		write_frame(&mut a, true, Opcode::Binary, true, [1, 2, 3, 4], b"ping").await.unwrap();
		let frame = read_frame(&mut b, 1 << 20).await.unwrap();
		assert_eq!(&frame.payload[..], b"ping");
	}

	#[tokio::test]
	async fn oversized_frame_is_rejected() {
		let (mut a, mut b) = duplex(4096);
		write_frame(&mut a, true, Opcode::Binary, false, [0; 4], &vec![0u8; 2048]).await.unwrap();
		let err = read_frame(&mut b, 1024).await.unwrap_err();
		assert!(matches!(err, ProxyError::BodyTooLarge));
	}

	#[tokio::test]
	async fn message_interceptor_rewrites_payload() {
		let interceptors = Arc::new(MessageInterceptors::new());
		interceptors.register(Arc::new(Upper));
		let message = Message {
			opcode: Opcode::Text,
			payload: Bytes::from_static(b"hi"),
		};
		match interceptors.run(Direction::ClientToUpstream, &message).await {
			MessageAction::Forward(payload) => assert_eq!(&payload[..], b"HI"),
			MessageAction::Drop => panic!("expected forward"),
		}
	}

	#[tokio::test]
	async fn message_interceptor_can_drop() {
		let interceptors = Arc::new(MessageInterceptors::new());
		interceptors.register(Arc::new(Dropper));
		let message = Message {
			opcode: Opcode::Text,
			payload: Bytes::from_static(b"hi"),
		};
		assert!(matches!(
			interceptors.run(Direction::ClientToUpstream, &message).await,
			MessageAction::Drop
		));
	}

	#[tokio::test]
	async fn registering_same_name_replaces_prior_entry() {
		let interceptors = MessageInterceptors::new();
		interceptors.register(Arc::new(Upper));
		interceptors.register(Arc::new(Upper));
		assert_eq!(interceptors.entries.load().len(), 1);
	}
}
