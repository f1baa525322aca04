use std::io::Cursor;

use rcgen::{CertificateParams, DistinguishedName, Issuer, KeyPair};
use rustls_pemfile::Item;
use rustls_pki_types::CertificateDer;

use crate::error::ProxyError;

/// The root CA's key material, loaded once at startup and held read-only for
/// the lifetime of the process (spec §5 "CA material — read-only after
/// load; no locking needed").
///
/// Module B signs leaves against this; nothing else touches it.
pub struct CertificateAuthority {
	cert_der: CertificateDer<'static>,
	cert_pem: String,
	key_pair: KeyPair,
	params: CertificateParams,
}

impl CertificateAuthority {
	/// Load a CA from PEM cert+key literal strings.
	pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<CertificateAuthority, ProxyError> {
		let cert_der = parse_cert_pem(cert_pem)?;
		let key_pair = KeyPair::from_pem(key_pem)
			.map_err(|e| ProxyError::ConfigInvalid(format!("invalid CA private key: {e}")))?;
		let params = CertificateParams::from_ca_cert_der(&cert_der)
			.map_err(|e| ProxyError::ConfigInvalid(format!("invalid CA certificate: {e}")))?;
		check_key_matches_cert(&cert_der, &key_pair)?;
		Ok(CertificateAuthority {
			cert_der,
			cert_pem: cert_pem.to_string(),
			key_pair,
			params,
		})
	}

	/// Load a CA from PEM files on disk.
	pub async fn from_paths(
		cert_path: &std::path::Path,
		key_path: &std::path::Path,
	) -> Result<CertificateAuthority, ProxyError> {
		let cert_pem = tokio::fs::read_to_string(cert_path)
			.await
			.map_err(|e| ProxyError::ConfigInvalid(format!("reading {cert_path:?}: {e}")))?;
		let key_pem = tokio::fs::read_to_string(key_path)
			.await
			.map_err(|e| ProxyError::ConfigInvalid(format!("reading {key_path:?}: {e}")))?;
		Self::from_pem(&cert_pem, &key_pem)
	}

	/// Generate a fresh, self-signed CA in memory. Used when no CA material is
	/// configured, mirroring the spec's "embedded generator invoked on first
	/// use" fallback for module A.
	pub fn generate() -> Result<CertificateAuthority, ProxyError> {
		let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
			.map_err(|e| ProxyError::ConfigInvalid(format!("generating CA key: {e}")))?;
		let mut params = CertificateParams::default();
		params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		params.key_usages = vec![
			rcgen::KeyUsagePurpose::KeyCertSign,
			rcgen::KeyUsagePurpose::CrlSign,
		];
		let mut dn = DistinguishedName::new();
		dn.push(rcgen::DnType::CommonName, "relay-proxy local CA");
		params.distinguished_name = dn;
		let cert = params
			.clone()
			.self_signed(&key_pair)
			.map_err(|e| ProxyError::ConfigInvalid(format!("self-signing CA: {e}")))?;
		let cert_pem = cert.pem();
		let cert_der = cert.der().clone();
		Ok(CertificateAuthority {
			cert_der,
			cert_pem,
			key_pair,
			params,
		})
	}

	/// The CA's public certificate in PEM, exposed so operators can install it
	/// in client trust stores (spec §4.A, §6, and the admin `/cert` route).
	pub fn public_cert_pem(&self) -> &str {
		&self.cert_pem
	}

	pub fn cert_der(&self) -> &CertificateDer<'static> {
		&self.cert_der
	}

	pub(crate) fn issuer(&self) -> Issuer<'_, KeyPair> {
		Issuer::new(self.params.clone(), &self.key_pair)
	}

	pub(crate) fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
		self.key_pair.algorithm()
	}
}

fn parse_cert_pem(pem: &str) -> Result<CertificateDer<'static>, ProxyError> {
	let mut reader = std::io::BufReader::new(Cursor::new(pem.as_bytes()));
	let item = rustls_pemfile::read_one(&mut reader)
		.map_err(|e| ProxyError::ConfigInvalid(format!("malformed CA cert PEM: {e}")))?
		.ok_or_else(|| ProxyError::ConfigInvalid("no certificate found in CA cert PEM".into()))?;
	match item {
		Item::X509Certificate(der) => Ok(der),
		_ => Err(ProxyError::ConfigInvalid(
			"CA cert PEM does not contain an X.509 certificate".into(),
		)),
	}
}

/// Compares the certificate's embedded public key against the loaded private
/// key's public half, so a mismatched cert/key pair fails fast at load time
/// with `CONFIG_INVALID` rather than at the first failed leaf signature.
fn check_key_matches_cert(cert_der: &CertificateDer<'_>, key_pair: &KeyPair) -> Result<(), ProxyError> {
	let (_, parsed) = x509_parser::parse_x509_certificate(cert_der)
		.map_err(|e| ProxyError::ConfigInvalid(format!("invalid CA certificate: {e}")))?;
	let cert_spki = parsed.tbs_certificate.subject_pki.raw;
	if cert_spki != key_pair.public_key_der() {
		return Err(ProxyError::ConfigInvalid(
			"CA certificate and private key do not match".into(),
		));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generated_ca_exposes_pem() {
		let ca = CertificateAuthority::generate().unwrap();
		assert!(ca.public_cert_pem().contains("BEGIN CERTIFICATE"));
	}

	#[test]
	fn from_pem_rejects_garbage() {
		let err = CertificateAuthority::from_pem("not a cert", "not a key").unwrap_err();
		assert!(matches!(err, ProxyError::ConfigInvalid(_)));
	}

	#[test]
	fn from_pem_rejects_mismatched_key() {
		let ca = CertificateAuthority::generate().unwrap();
		let other_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
		let err = CertificateAuthority::from_pem(&ca.cert_pem, &other_key.serialize_pem()).unwrap_err();
		assert!(matches!(err, ProxyError::ConfigInvalid(_)));
	}

	#[test]
	fn from_pem_accepts_matching_pair() {
		let ca = CertificateAuthority::generate().unwrap();
		let reloaded = CertificateAuthority::from_pem(&ca.cert_pem, &ca.key_pair.serialize_pem()).unwrap();
		assert_eq!(reloaded.public_cert_pem(), ca.public_cert_pem());
	}

	#[tokio::test]
	async fn from_paths_loads_pem_files_from_disk() {
		let ca = CertificateAuthority::generate().unwrap();
		let mut cert_file = tempfile::NamedTempFile::new().unwrap();
		let mut key_file = tempfile::NamedTempFile::new().unwrap();
		std::io::Write::write_all(&mut cert_file, ca.cert_pem.as_bytes()).unwrap();
		std::io::Write::write_all(&mut key_file, ca.key_pair.serialize_pem().as_bytes()).unwrap();

		let reloaded = CertificateAuthority::from_paths(cert_file.path(), key_file.path())
			.await
			.unwrap();
		assert_eq!(reloaded.public_cert_pem(), ca.public_cert_pem());
	}

	#[tokio::test]
	async fn from_paths_rejects_missing_file() {
		let err = CertificateAuthority::from_paths(
			std::path::Path::new("/nonexistent/ca.pem"),
			std::path::Path::new("/nonexistent/ca.key"),
		)
		.await
		.unwrap_err();
		assert_matches::assert_matches!(err, ProxyError::ConfigInvalid(_));
	}
}
