use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

/// Picks the framing of a response body specifically (spec §4.G step 6):
/// unlike a request, a response with neither `Content-Length` nor `chunked`
/// is not bodyless, it is close-delimited (RFC 7230 §3.3.3 rule 7), and
/// `HEAD` responses plus `204`/`304`/1xx statuses never carry a body
/// regardless of what the headers claim.
pub fn response_body_framing(request_method: &Method, status: StatusCode, headers: &HeaderMap) -> BodyFraming {
	if request_method == Method::HEAD
		|| status == StatusCode::NO_CONTENT
		|| status == StatusCode::NOT_MODIFIED
		|| status.is_informational()
	{
		return BodyFraming::None;
	}
	match framing_of(headers) {
		BodyFraming::None => BodyFraming::UntilClose,
		other => other,
	}
}

/// How a message body is delimited on the wire (spec §4.G step 5 "body
/// framing").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
	None,
	Length(u64),
	Chunked,
	UntilClose,
}

/// Picks the framing a set of headers declares, chunked taking precedence
/// over `Content-Length` per RFC 7230 §3.3.3.
pub fn framing_of(headers: &HeaderMap) -> BodyFraming {
	let chunked = headers
		.get(http::header::TRANSFER_ENCODING)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("chunked"))
		.unwrap_or(false);
	if chunked {
		return BodyFraming::Chunked;
	}
	if let Some(len) = headers
		.get(http::header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<u64>().ok())
	{
		return BodyFraming::Length(len);
	}
	BodyFraming::None
}

/// Writes a request line + headers in origin-form or absolute-form
/// (spec §4.G step 5).
pub async fn write_request_head<W: AsyncWrite + Unpin>(
	w: &mut W,
	method: &Method,
	target: &str,
	version: Version,
	headers: &HeaderMap,
) -> Result<(), ProxyError> {
	let version_str = if version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" };
	let mut head = format!("{method} {target} {version_str}\r\n");
	write_headers(&mut head, headers);
	head.push_str("\r\n");
	w
		.write_all(head.as_bytes())
		.await
		.map_err(|e| ProxyError::ProcessingString(format!("writing request head: {e}")))
}

pub async fn write_response_head<W: AsyncWrite + Unpin>(
	w: &mut W,
	status: StatusCode,
	headers: &HeaderMap,
) -> Result<(), ProxyError> {
	let reason = status.canonical_reason().unwrap_or("");
	let mut head = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason);
	write_headers(&mut head, headers);
	head.push_str("\r\n");
	w
		.write_all(head.as_bytes())
		.await
		.map_err(|e| ProxyError::ProcessingString(format!("writing response head: {e}")))
}

fn write_headers(head: &mut String, headers: &HeaderMap) {
	for (name, value) in headers.iter() {
		let Ok(v) = value.to_str() else { continue };
		if name == http::header::WWW_AUTHENTICATE {
			for challenge in split_www_authenticate(v) {
				head.push_str(name.as_str());
				head.push_str(": ");
				head.push_str(&challenge);
				head.push_str("\r\n");
			}
			continue;
		}
		head.push_str(name.as_str());
		head.push_str(": ");
		head.push_str(v);
		head.push_str("\r\n");
	}
}

pub struct ResponseHead {
	pub status: StatusCode,
	pub version: Version,
	pub headers: HeaderMap,
}

pub struct RequestHead {
	pub method: Method,
	pub target: String,
	pub version: Version,
	pub headers: HeaderMap,
}

/// Reads a status line + headers from an upstream connection
/// (spec §4.G step 6).
pub async fn read_response_head<R: AsyncRead + Unpin>(r: &mut R) -> Result<ResponseHead, ProxyError> {
	let status_line = read_crlf_line(r).await?;
	let mut parts = status_line.splitn(3, ' ');
	let version = match parts.next() {
		Some("HTTP/1.0") => Version::HTTP_10,
		Some("HTTP/1.1") => Version::HTTP_11,
		_ => return Err(ProxyError::ProtocolViolation(format!("malformed status line: {status_line}"))),
	};
	let status = parts
		.next()
		.and_then(|s| s.parse::<u16>().ok())
		.and_then(|s| StatusCode::from_u16(s).ok())
		.ok_or_else(|| ProxyError::ProtocolViolation(format!("malformed status line: {status_line}")))?;
	let headers = read_headers(r).await?;
	Ok(ResponseHead { status, version, headers })
}

/// Reads a request line + headers from a client connection
/// (spec §4.J "parse the first request line").
pub async fn read_request_head<R: AsyncRead + Unpin>(r: &mut R) -> Result<RequestHead, ProxyError> {
	let request_line = read_crlf_line(r).await?;
	let mut parts = request_line.splitn(3, ' ');
	let method = parts
		.next()
		.ok_or_else(|| ProxyError::ProtocolViolation("empty request line".into()))?
		.parse::<Method>()
		.map_err(|_| ProxyError::ProtocolViolation(format!("malformed method in: {request_line}")))?;
	let target = parts
		.next()
		.ok_or_else(|| ProxyError::ProtocolViolation(format!("missing target in: {request_line}")))?
		.to_string();
	let version = match parts.next() {
		Some("HTTP/1.0") => Version::HTTP_10,
		Some("HTTP/1.1") => Version::HTTP_11,
		_ => return Err(ProxyError::ProtocolViolation(format!("malformed request line: {request_line}"))),
	};
	let headers = read_headers(r).await?;
	Ok(RequestHead { method, target, version, headers })
}

async fn read_headers<R: AsyncRead + Unpin>(r: &mut R) -> Result<HeaderMap, ProxyError> {
	let mut headers = HeaderMap::new();
	loop {
		let line = read_crlf_line(r).await?;
		if line.is_empty() {
			break;
		}
		let Some((name, value)) = line.split_once(':') else {
			continue;
		};
		let Ok(name) = HeaderName::from_bytes(name.trim().as_bytes()) else {
			continue;
		};
		let Ok(value) = HeaderValue::from_str(value.trim()) else {
			continue;
		};
		if name == http::header::WWW_AUTHENTICATE {
			merge_www_authenticate(&mut headers, value);
			continue;
		}
		headers.append(name, value);
	}
	Ok(headers)
}

/// Folds a newly-read `WWW-Authenticate` challenge onto any prior one already
/// in `headers` into a single comma-joined value (spec §4.G "Header
/// transforms (always): normalize www-authenticate (preserve multiple
/// challenges as a comma-joined sequence on reception, split on emission)").
fn merge_www_authenticate(headers: &mut HeaderMap, value: HeaderValue) {
	match headers.remove(http::header::WWW_AUTHENTICATE) {
		Some(existing) => {
			let mut joined = existing.to_str().unwrap_or_default().to_string();
			joined.push_str(", ");
			joined.push_str(value.to_str().unwrap_or_default());
			if let Ok(joined) = HeaderValue::from_str(&joined) {
				headers.append(http::header::WWW_AUTHENTICATE, joined);
			}
		},
		None => headers.append(http::header::WWW_AUTHENTICATE, value),
	}
}

/// Splits a comma-joined `WWW-Authenticate` value back into one header line
/// per challenge on emission, the inverse of `merge_www_authenticate`. A
/// challenge's own parameters may themselves contain commas inside quoted
/// strings, so the split only breaks on a comma followed by a challenge
/// scheme token (`Token ...`), not on every comma.
fn split_www_authenticate(value: &str) -> Vec<String> {
	let mut challenges = Vec::new();
	let mut current = String::new();
	let mut in_quotes = false;
	let mut chars = value.chars().peekable();
	while let Some(c) = chars.next() {
		match c {
			'"' => {
				in_quotes = !in_quotes;
				current.push(c);
			},
			',' if !in_quotes => {
				// A comma inside a challenge's parameter list is followed by
				// `key=`; a comma separating challenges is followed by a
				// bare scheme token then whitespace, e.g. `, Digest realm=`.
				let rest: String = chars.clone().collect();
				let looks_like_new_challenge = rest
					.trim_start()
					.split_once(char::is_whitespace)
					.map(|(token, _)| !token.contains('='))
					.unwrap_or(!rest.trim().is_empty() && !rest.contains('='));
				if looks_like_new_challenge {
					challenges.push(current.trim().to_string());
					current = String::new();
				} else {
					current.push(c);
				}
			},
			_ => current.push(c),
		}
	}
	if !current.trim().is_empty() {
		challenges.push(current.trim().to_string());
	}
	challenges
}

/// Byte-by-byte CRLF line read, same rationale as `client::dial`'s
/// `read_crlf_line`: a buffered reader could pull ahead into body bytes that
/// immediately follow the header block.
async fn read_crlf_line<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProxyError> {
	let mut line = Vec::new();
	let mut byte = [0u8; 1];
	let mut prev_was_cr = false;
	loop {
		r
			.read_exact(&mut byte)
			.await
			.map_err(|_| ProxyError::UpstreamAborted)?;
		if byte[0] == b'\n' && prev_was_cr {
			line.pop();
			break;
		}
		prev_was_cr = byte[0] == b'\r';
		line.push(byte[0]);
	}
	Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Copies exactly `len` bytes from `r` to `w` (length-prefixed framing).
pub async fn copy_length_body<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
	r: &mut R,
	w: &mut W,
	len: u64,
) -> Result<u64, ProxyError> {
	let mut taken = r.take(len);
	tokio::io::copy(&mut taken, w)
		.await
		.map_err(|e| ProxyError::ProcessingString(format!("copying body: {e}")))
}

/// Copies until EOF (close-delimited framing, used for responses with
/// neither `Content-Length` nor `chunked`).
pub async fn copy_until_close<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
	r: &mut R,
	w: &mut W,
) -> Result<u64, ProxyError> {
	tokio::io::copy(r, w)
		.await
		.map_err(|e| ProxyError::ProcessingString(format!("copying body: {e}")))
}

/// Forwards a chunked body chunk-by-chunk, preserving the wire framing.
/// Trailers are forwarded only when `forward_trailers` is set (spec's
/// boundary behavior "trailers dropped unless declared in Trailer").
pub async fn copy_chunked_body<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
	r: &mut R,
	w: &mut W,
	forward_trailers: bool,
) -> Result<u64, ProxyError> {
	let mut total = 0u64;
	loop {
		let size_line = read_crlf_line(r).await?;
		let size_str = size_line.split(';').next().unwrap_or("");
		let size = u64::from_str_radix(size_str.trim(), 16)
			.map_err(|_| ProxyError::ProtocolViolation(format!("malformed chunk size: {size_line}")))?;
		w
			.write_all(format!("{size:x}\r\n").as_bytes())
			.await
			.map_err(|e| ProxyError::ProcessingString(format!("writing chunk size: {e}")))?;
		if size == 0 {
			loop {
				let trailer_line = read_crlf_line(r).await?;
				if trailer_line.is_empty() {
					break;
				}
				if forward_trailers {
					w
						.write_all(format!("{trailer_line}\r\n").as_bytes())
						.await
						.map_err(|e| ProxyError::ProcessingString(format!("writing trailer: {e}")))?;
				}
			}
			w
				.write_all(b"\r\n")
				.await
				.map_err(|e| ProxyError::ProcessingString(format!("writing final CRLF: {e}")))?;
			return Ok(total);
		}
		let mut chunk = vec![0u8; size as usize];
		r
			.read_exact(&mut chunk)
			.await
			.map_err(|_| ProxyError::UpstreamAborted)?;
		let mut crlf = [0u8; 2];
		r
			.read_exact(&mut crlf)
			.await
			.map_err(|_| ProxyError::UpstreamAborted)?;
		w
			.write_all(&chunk)
			.await
			.map_err(|e| ProxyError::ProcessingString(format!("writing chunk: {e}")))?;
		w
			.write_all(b"\r\n")
			.await
			.map_err(|e| ProxyError::ProcessingString(format!("writing chunk CRLF: {e}")))?;
		total += size;
	}
}

/// Reads a length-delimited body fully into memory, bounded by
/// `max_buffer` (spec §5 "above that, such a modification fails with
/// BODY_TOO_LARGE").
pub async fn read_length_body_to_bytes<R: AsyncRead + Unpin>(
	r: &mut R,
	len: u64,
	max_buffer: usize,
) -> Result<Bytes, ProxyError> {
	if len as usize > max_buffer {
		return Err(ProxyError::BodyTooLarge);
	}
	let mut buf = BytesMut::with_capacity(len as usize);
	buf.resize(len as usize, 0);
	r
		.read_exact(&mut buf)
		.await
		.map_err(|_| ProxyError::UpstreamAborted)?;
	Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn writes_request_line_and_headers() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::HOST, HeaderValue::from_static("example.test"));
		let mut out = Vec::new();
		write_request_head(&mut out, &Method::GET, "/foo", Version::HTTP_11, &headers)
			.await
			.unwrap();
		let text = String::from_utf8(out).unwrap();
		assert!(text.starts_with("GET /foo HTTP/1.1\r\n"));
		assert!(text.contains("host: example.test\r\n"));
		assert!(text.ends_with("\r\n\r\n"));
	}

	#[tokio::test]
	async fn reads_response_head() {
		let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n";
		let mut cursor = std::io::Cursor::new(raw.to_vec());
		let head = read_response_head(&mut cursor).await.unwrap();
		assert_eq!(head.status, StatusCode::OK);
		assert_eq!(framing_of(&head.headers), BodyFraming::Length(2));
	}

	#[tokio::test]
	async fn chunked_body_round_trips() {
		let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
		let mut cursor = std::io::Cursor::new(raw.to_vec());
		let mut out = Vec::new();
		let n = copy_chunked_body(&mut cursor, &mut out, false).await.unwrap();
		assert_eq!(n, 9);
		assert_eq!(out, raw);
	}

	#[tokio::test]
	async fn multiple_www_authenticate_challenges_merge_on_read() {
		let raw = b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"a\"\r\nWWW-Authenticate: Digest realm=\"b\"\r\n\r\n";
		let mut cursor = std::io::Cursor::new(raw.to_vec());
		let head = read_response_head(&mut cursor).await.unwrap();
		let values: Vec<_> = head.headers.get_all(http::header::WWW_AUTHENTICATE).iter().collect();
		assert_eq!(values.len(), 1);
		assert_eq!(values[0].to_str().unwrap(), "Basic realm=\"a\", Digest realm=\"b\"");
	}

	#[test]
	fn split_www_authenticate_separates_distinct_schemes() {
		let challenges = split_www_authenticate("Basic realm=\"a\", Digest realm=\"b\", qop=\"auth\"");
		assert_eq!(challenges, vec!["Basic realm=\"a\"", "Digest realm=\"b\", qop=\"auth\""]);
	}

	#[test]
	fn response_without_length_or_chunked_is_until_close() {
		let headers = HeaderMap::new();
		assert_eq!(
			response_body_framing(&Method::GET, StatusCode::OK, &headers),
			BodyFraming::UntilClose
		);
	}

	#[test]
	fn head_response_has_no_body_even_with_content_length() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("12"));
		assert_eq!(
			response_body_framing(&Method::HEAD, StatusCode::OK, &headers),
			BodyFraming::None
		);
	}

	#[test]
	fn no_content_status_has_no_body() {
		let headers = HeaderMap::new();
		assert_eq!(
			response_body_framing(&Method::GET, StatusCode::NO_CONTENT, &headers),
			BodyFraming::None
		);
	}

	#[tokio::test]
	async fn www_authenticate_round_trips_to_one_line_per_challenge() {
		let mut headers = HeaderMap::new();
		headers.insert(
			http::header::WWW_AUTHENTICATE,
			HeaderValue::from_static("Basic realm=\"a\", Digest realm=\"b\""),
		);
		let mut out = Vec::new();
		write_response_head(&mut out, StatusCode::UNAUTHORIZED, &headers).await.unwrap();
		let text = String::from_utf8(out).unwrap();
		assert_eq!(text.matches("WWW-Authenticate").count(), 2);
		assert!(text.contains("WWW-Authenticate: Basic realm=\"a\"\r\n"));
		assert!(text.contains("WWW-Authenticate: Digest realm=\"b\"\r\n"));
	}
}
