use std::time::{Duration, SystemTime};

use rcgen::{CertificateParams, DistinguishedName, KeyPair, SanType, SerialNumber};

use super::LeafCert;
use crate::ca::CertificateAuthority;
use crate::error::ProxyError;

/// Signs a fresh leaf for `host`, using the same key algorithm family as the
/// CA (spec §4.B "same algorithm family as CA unless overridden").
pub(super) fn mint_leaf(
	ca: &CertificateAuthority,
	host: &str,
	leaf_ttl: Duration,
	skew: Duration,
) -> Result<LeafCert, ProxyError> {
	let key_pair = KeyPair::generate_for(ca.algorithm())
		.map_err(|e| ProxyError::CertMintFailed(format!("{host}: generating leaf key: {e}")))?;

	let sans = sans_for(host);
	let mut params = CertificateParams::default();
	params.subject_alt_names = sans
		.iter()
		.map(|s| to_san_type(s))
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| ProxyError::CertMintFailed(format!("{host}: {e}")))?;

	let not_before = SystemTime::now()
		.checked_sub(skew)
		.unwrap_or(SystemTime::UNIX_EPOCH);
	let not_after = SystemTime::now() + leaf_ttl;
	params.not_before = not_before.into();
	params.not_after = not_after.into();

	// 128-bit random serial (spec §9 open question: not the fixed `01` the
	// source uses, and not a monotonic counter requiring persisted state).
	let serial: u128 = rand::random();
	params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));

	params.distinguished_name = DistinguishedName::new();
	params.key_usages = vec![
		rcgen::KeyUsagePurpose::DigitalSignature,
		rcgen::KeyUsagePurpose::KeyEncipherment,
	];
	params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
	params.is_ca = rcgen::IsCa::NoCa;

	let issuer = ca.issuer();
	let cert = params
		.signed_by(&key_pair, &issuer)
		.map_err(|e| ProxyError::CertMintFailed(format!("{host}: signing leaf: {e}")))?;

	let mut chain = vec![cert.der().clone()];
	chain.push(ca.cert_der().clone());

	Ok(LeafCert {
		chain,
		key: rustls_pki_types::PrivateKeyDer::Pkcs8(key_pair.serialize_der().into()),
		not_after,
		sans,
	})
}

/// The requested host, plus its bare form if a wildcard was given
/// (spec §4.B SAN rule).
fn sans_for(host: &str) -> Vec<String> {
	let mut sans = vec![host.to_string()];
	if let Some(bare) = host.strip_prefix("*.") {
		sans.push(bare.to_string());
	}
	sans
}

fn to_san_type(host: &str) -> Result<SanType, String> {
	if let Ok(ip) = host.parse::<std::net::IpAddr>() {
		return Ok(SanType::IpAddress(ip));
	}
	host
		.to_string()
		.try_into()
		.map(SanType::DnsName)
		.map_err(|_| format!("{host}: not a valid DNS name for a SAN"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sans_include_bare_form_for_wildcard() {
		assert_eq!(sans_for("api.x.com"), vec!["api.x.com"]);
		assert_eq!(
			sans_for("*.x.com"),
			vec!["*.x.com".to_string(), "x.com".to_string()]
		);
	}

	#[test]
	fn mints_a_verifiable_leaf() {
		let ca = CertificateAuthority::generate().unwrap();
		let leaf = mint_leaf(&ca, "example.test", Duration::from_secs(3600), Duration::from_secs(60)).unwrap();
		assert_eq!(leaf.sans, vec!["example.test".to_string()]);
		assert!(leaf.not_after > SystemTime::now());

		let (_, parsed) = x509_parser::parse_x509_certificate(&leaf.chain[0]).unwrap();
		let sans: Vec<String> = parsed
			.subject_alternative_name()
			.unwrap()
			.unwrap()
			.value
			.general_names
			.iter()
			.filter_map(|n| match n {
				x509_parser::extensions::GeneralName::DNSName(d) => Some(d.to_string()),
				_ => None,
			})
			.collect();
		assert!(sans.contains(&"example.test".to_string()));
	}
}
