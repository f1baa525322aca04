use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::cert::LeafCert;
use crate::error::ProxyError;

/// Builds a per-SNI rustls `ServerConfig` presenting `leaf` to the client,
/// used by the CONNECT state machine (module H) when it decides MITM.
pub fn server_config_for_leaf(leaf: &LeafCert) -> Result<Arc<ServerConfig>, ProxyError> {
	let config = ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(leaf.chain.clone(), leaf.key.clone())
		.map_err(|e| ProxyError::TlsHandshakeFailed(format!("building server config: {e}")))?;
	Ok(Arc::new(config))
}

/// A shared upstream `ClientConfig` trusting the platform's native root
/// store, used by module C's DIRECT dial policy when the target scheme is
/// `https` (spec §4.C). Built once and reused across dials.
pub fn native_roots_client_config() -> Result<Arc<ClientConfig>, ProxyError> {
	let mut roots = RootCertStore::empty();
	let native = rustls_native_certs::load_native_certs();
	for err in &native.errors {
		tracing::warn!(%err, "error loading a native root certificate");
	}
	for cert in native.certs {
		// Individual malformed roots are skipped rather than failing the whole
		// proxy; `add` only errors on malformed DER, which load_native_certs
		// has already filtered for the happy path.
		let _ = roots.add(cert);
	}
	let config = ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	Ok(Arc::new(config))
}

/// Peek up to `n` bytes of a TLS ClientHello without consuming them, per
/// spec §4.H ("peek up to N (default 3) bytes ... if the first byte is
/// `0x16`"). The full classification only needs the first byte; extracting
/// SNI (`extract_sni`) needs the whole ClientHello record, which callers
/// peek separately with a larger buffer once they know it's worth it.
pub fn looks_like_tls_handshake(peeked: &[u8]) -> bool {
	peeked.first() == Some(&0x16)
}

/// Hand-parses a TLS ClientHello record to pull out the SNI host name, used
/// by the CONNECT state machine to select which leaf to mint/present.
/// Returns `None` on any malformed or absent extension rather than erroring
/// — callers treat "no SNI" as "can't MITM, fall back to TUNNEL".
pub fn extract_sni(buf: &[u8]) -> Option<String> {
	if buf.len() < 5 || buf[0] != 0x16 {
		return None;
	}
	let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
	let handshake = &buf[5..buf.len().min(5 + record_len)];

	if handshake.is_empty() || handshake[0] != 0x01 {
		return None;
	}
	let hs_len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
	let client_hello = &handshake[4..handshake.len().min(4 + hs_len)];

	if client_hello.len() < 34 {
		return None;
	}
	let mut pos = 34; // protocol version (2) + random (32)

	let session_id_len = *client_hello.get(pos)? as usize;
	pos += 1 + session_id_len;

	let cipher_suites_len =
		u16::from_be_bytes([*client_hello.get(pos)?, *client_hello.get(pos + 1)?]) as usize;
	pos += 2 + cipher_suites_len;

	let compression_len = *client_hello.get(pos)? as usize;
	pos += 1 + compression_len;

	let extensions_len =
		u16::from_be_bytes([*client_hello.get(pos)?, *client_hello.get(pos + 1)?]) as usize;
	pos += 2;
	let extensions_end = (pos + extensions_len).min(client_hello.len());

	while pos + 4 <= extensions_end {
		let ext_type = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]);
		let ext_len = u16::from_be_bytes([client_hello[pos + 2], client_hello[pos + 3]]) as usize;
		pos += 4;
		if ext_type == 0x0000 {
			// server_name_list_length(2) + server_name_type(1) + host_name_length(2) + host_name
			if ext_len >= 5 && pos + ext_len <= extensions_end && client_hello[pos + 2] == 0x00 {
				let name_len =
					u16::from_be_bytes([client_hello[pos + 3], client_hello[pos + 4]]) as usize;
				let start = pos + 5;
				if start + name_len <= extensions_end {
					return String::from_utf8(client_hello[start..start + name_len].to_vec()).ok();
				}
			}
			return None;
		}
		pos += ext_len;
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn non_tls_bytes_are_not_a_handshake() {
		assert!(!looks_like_tls_handshake(b"GET / HTTP/1.1\r\n"));
		assert!(!looks_like_tls_handshake(b""));
	}

	#[test]
	fn tls_handshake_byte_is_recognized() {
		assert!(looks_like_tls_handshake(&[0x16, 0x03, 0x01]));
	}

	#[test]
	fn extract_sni_none_for_non_tls() {
		assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n"), None);
		assert_eq!(extract_sni(&[]), None);
	}
}
