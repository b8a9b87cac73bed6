use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;

use crate::error::{AppError, AppResult, ParseErrorKind};
use crate::sharding::topology::Capability;

/// Private-arc OIDs carrying shard identity inside the certificate. The
/// exact arc is a deployment choice; these match the cluster CA tooling.
const OID_SHARD_ID: &str = "1.3.6.1.4.1.55555.1.1";
const OID_DATACENTER: &str = "1.3.6.1.4.1.55555.1.2";
const OID_RACK: &str = "1.3.6.1.4.1.55555.1.3";
const OID_TOKEN_RANGE_START: &str = "1.3.6.1.4.1.55555.1.4";
const OID_TOKEN_RANGE_END: &str = "1.3.6.1.4.1.55555.1.5";
const OID_CAPABILITIES: &str = "1.3.6.1.4.1.55555.1.6";
const OID_ROLE: &str = "1.3.6.1.4.1.55555.1.7";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardRole {
    Primary,
    Replica,
}

/// Parsed X.509 certificate with the shard-identity extensions. The
/// certificate binds a shard id, its location and its capabilities to a
/// TLS identity, which is what makes the topology trustworthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardCertificateInfo {
    pub subject_cn: String,
    pub issuer_cn: String,
    /// Uppercase hex, no separators, leading zero bytes stripped.
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,

    pub san_dns: Vec<String>,
    pub san_ip: Vec<String>,
    pub san_uri: Vec<String>,

    pub shard_id: String,
    pub datacenter: String,
    pub rack: String,
    pub token_range_start: u64,
    pub token_range_end: u64,
    pub capabilities: Vec<Capability>,
    pub role: ShardRole,
}

impl ShardCertificateInfo {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn is_valid_now(&self) -> bool {
        let now = Utc::now();
        now >= self.not_before && now <= self.not_after
    }
}

fn cert_error(msg: impl Into<String>) -> AppError {
    AppError::Parse(ParseErrorKind::CertInvalid, msg.into())
}

/// Serial of a DER-encoded certificate, uppercase hex. Used by the HSM
/// core to cache the sender identity from the token's certificate object.
pub(crate) fn serial_from_der(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    Some(serial_hex(cert.raw_serial()))
}

fn serial_hex(raw: &[u8]) -> String {
    // Strip ASN.1 sign padding so the serial compares equal across
    // parsers that do or do not keep the leading zero byte.
    let trimmed: &[u8] = match raw.iter().position(|&b| b != 0) {
        Some(pos) => &raw[pos..],
        None => &raw[raw.len().saturating_sub(1)..],
    };
    hex::encode_upper(trimmed)
}

fn parse_capabilities(raw: &str) -> Vec<Capability> {
    raw.split(',')
        .filter_map(|part| match part.trim() {
            "read" => Some(Capability::Read),
            "write" => Some(Capability::Write),
            "replicate" => Some(Capability::Replicate),
            "admin" => Some(Capability::Admin),
            "" => None,
            other => {
                warn!("Ignoring unknown capability '{}' in certificate", other);
                None
            }
        })
        .collect()
}

/// CN fallback for certificates minted without the shard extensions:
/// `shard-001.themis.local` yields `shard_001` with default read/write
/// capabilities over the full token range. A bootstrap aid only: it
/// carries no more authority than the CN itself, so production
/// deployments must populate the extensions explicitly.
fn shard_id_from_cn(subject_cn: &str) -> Option<String> {
    if !subject_cn.starts_with("shard-") {
        return None;
    }
    let host = subject_cn.split('.').next().unwrap_or(subject_cn);
    Some(host.replace('-', "_"))
}

/// Parse a PEM-encoded shard certificate.
pub fn parse_pem(pem_data: &[u8]) -> AppResult<ShardCertificateInfo> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem_data)
        .map_err(|e| cert_error(format!("Invalid PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| cert_error(format!("Invalid X.509 certificate: {}", e)))?;
    extract_info(&cert)
}

pub fn parse_file(path: impl AsRef<Path>) -> AppResult<ShardCertificateInfo> {
    let data = std::fs::read(path.as_ref())?;
    parse_pem(&data)
}

fn extract_info(cert: &X509Certificate<'_>) -> AppResult<ShardCertificateInfo> {
    let subject_cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let issuer_cn = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let serial_number = serial_hex(cert.raw_serial());

    let not_before = Utc
        .timestamp_opt(cert.validity().not_before.timestamp(), 0)
        .single()
        .ok_or_else(|| cert_error("Invalid notBefore"))?;
    let not_after = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| cert_error("Invalid notAfter"))?;

    let mut info = ShardCertificateInfo {
        subject_cn,
        issuer_cn,
        serial_number,
        not_before,
        not_after,
        san_dns: Vec::new(),
        san_ip: Vec::new(),
        san_uri: Vec::new(),
        shard_id: String::new(),
        datacenter: String::new(),
        rack: String::new(),
        token_range_start: 0,
        token_range_end: u64::MAX,
        capabilities: Vec::new(),
        role: ShardRole::Primary,
    };

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => info.san_dns.push((*dns).to_string()),
                GeneralName::IPAddress(bytes) => {
                    let ip = match bytes.len() {
                        4 => {
                            let octets: [u8; 4] = (*bytes).try_into().unwrap();
                            std::net::IpAddr::from(octets).to_string()
                        }
                        16 => {
                            let octets: [u8; 16] = (*bytes).try_into().unwrap();
                            std::net::IpAddr::from(octets).to_string()
                        }
                        _ => continue,
                    };
                    info.san_ip.push(ip);
                }
                GeneralName::URI(uri) => info.san_uri.push((*uri).to_string()),
                _ => {}
            }
        }
    }

    parse_shard_extensions(cert, &mut info);

    if info.shard_id.is_empty() {
        // No shard extensions present: fall back to the CN heuristic.
        if let Some(shard_id) = shard_id_from_cn(&info.subject_cn) {
            debug!(
                "Certificate {} has no shard extensions, derived shard id {} from CN",
                info.serial_number, shard_id
            );
            info.shard_id = shard_id;
            if info.capabilities.is_empty() {
                info.capabilities = vec![Capability::Read, Capability::Write];
            }
        }
    }

    Ok(info)
}

fn parse_shard_extensions(cert: &X509Certificate<'_>, info: &mut ShardCertificateInfo) {
    for ext in cert.extensions() {
        let oid = ext.oid.to_id_string();
        let Ok(value) = std::str::from_utf8(ext.value) else {
            continue;
        };
        let value = value.trim_matches(char::from(0)).trim();
        match oid.as_str() {
            OID_SHARD_ID => info.shard_id = value.to_string(),
            OID_DATACENTER => info.datacenter = value.to_string(),
            OID_RACK => info.rack = value.to_string(),
            OID_TOKEN_RANGE_START => {
                if let Ok(start) = value.parse() {
                    info.token_range_start = start;
                }
            }
            OID_TOKEN_RANGE_END => {
                if let Ok(end) = value.parse() {
                    info.token_range_end = end;
                }
            }
            OID_CAPABILITIES => info.capabilities = parse_capabilities(value),
            OID_ROLE => {
                info.role = match value {
                    "replica" => ShardRole::Replica,
                    _ => ShardRole::Primary,
                };
            }
            _ => {}
        }
    }
}

/// RSA public key carried by a PEM certificate, for envelope signature
/// verification.
pub fn rsa_public_key_from_pem(pem_data: &[u8]) -> AppResult<rsa::RsaPublicKey> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem_data)
        .map_err(|e| cert_error(format!("Invalid PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| cert_error(format!("Invalid X.509 certificate: {}", e)))?;

    match cert.public_key().parsed() {
        Ok(x509_parser::public_key::PublicKey::RSA(pk)) => {
            let n = rsa::BigUint::from_bytes_be(pk.modulus);
            let e = rsa::BigUint::from_bytes_be(pk.exponent);
            rsa::RsaPublicKey::new(n, e)
                .map_err(|e| cert_error(format!("Invalid RSA public key: {}", e)))
        }
        _ => Err(cert_error("Certificate does not carry an RSA public key")),
    }
}

/// Cryptographic signature check of `cert_pem` against `ca_pem`'s public
/// key. Nothing more: revocation and shard-use validation are separate.
pub fn verify_against_ca(cert_pem: &[u8], ca_pem: &[u8]) -> AppResult<bool> {
    let (_, cert_der) = x509_parser::pem::parse_x509_pem(cert_pem)
        .map_err(|e| cert_error(format!("Invalid certificate PEM: {}", e)))?;
    let cert = cert_der
        .parse_x509()
        .map_err(|e| cert_error(format!("Invalid X.509 certificate: {}", e)))?;

    let (_, ca_der) = x509_parser::pem::parse_x509_pem(ca_pem)
        .map_err(|e| cert_error(format!("Invalid CA PEM: {}", e)))?;
    let ca = ca_der
        .parse_x509()
        .map_err(|e| cert_error(format!("Invalid CA certificate: {}", e)))?;

    Ok(cert.verify_signature(Some(ca.public_key())).is_ok())
}

/// Membership test in the CRL at `crl_path`. A missing or unreadable CRL
/// means "not revoked": absence fails open, presence does not.
pub fn is_revoked(serial_number: &str, crl_path: impl AsRef<Path>) -> bool {
    let Ok(data) = std::fs::read(crl_path.as_ref()) else {
        return false;
    };

    for pem in Pem::iter_from_buffer(&data).flatten() {
        let Ok((_, crl)) = CertificateRevocationList::from_der(&pem.contents) else {
            continue;
        };
        for revoked in crl.iter_revoked_certificates() {
            let revoked_serial = serial_hex(&revoked.user_certificate.to_bytes_be());
            if revoked_serial == serial_number {
                return true;
            }
        }
    }

    false
}

/// The combined shard-use invariant: within the validity window, a
/// non-empty shard id, at least one capability and a non-inverted token
/// range.
pub fn validate_for_shard_use(info: &ShardCertificateInfo) -> bool {
    if !info.is_valid_now() {
        return false;
    }
    if info.shard_id.is_empty() {
        return false;
    }
    if info.capabilities.is_empty() {
        return false;
    }
    info.token_range_start <= info.token_range_end
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rcgen::{
        date_time_ymd, CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair,
        SerialNumber,
    };

    fn valid_info() -> ShardCertificateInfo {
        test_support::sample_info()
    }

    fn cert_params(cn: &str) -> CertificateParams {
        let mut params =
            CertificateParams::new(vec!["shard-001.themis.local".to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.not_before = date_time_ymd(2024, 1, 1);
        params.not_after = date_time_ymd(2040, 1, 1);
        params.serial_number = Some(SerialNumber::from(vec![0x0A, 0xBC]));
        params
    }

    fn shard_ext(oid_tail: u64, content: &[u8]) -> CustomExtension {
        CustomExtension::from_oid_content(
            &[1, 3, 6, 1, 4, 1, 55555, 1, oid_tail],
            content.to_vec(),
        )
    }

    #[test]
    fn test_parse_pem_extracts_shard_extensions() {
        // CN deliberately not shard-prefixed: the extensions, not the CN
        // heuristic, must supply the identity.
        let mut params = cert_params("db-node-7.themis.local");
        params.custom_extensions = vec![
            shard_ext(1, b"shard_042"),
            shard_ext(2, b"dc2"),
            shard_ext(3, b"rack07"),
            shard_ext(4, b"1000"),
            shard_ext(5, b"2000"),
            shard_ext(6, b"read,write,replicate"),
            shard_ext(7, b"replica"),
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let info = parse_pem(cert.pem().as_bytes()).unwrap();
        assert_eq!(info.subject_cn, "db-node-7.themis.local");
        assert_eq!(info.serial_number, "0ABC");
        assert_eq!(info.san_dns, vec!["shard-001.themis.local".to_string()]);
        assert_eq!(info.shard_id, "shard_042");
        assert_eq!(info.datacenter, "dc2");
        assert_eq!(info.rack, "rack07");
        assert_eq!(info.token_range_start, 1000);
        assert_eq!(info.token_range_end, 2000);
        assert_eq!(
            info.capabilities,
            vec![Capability::Read, Capability::Write, Capability::Replicate]
        );
        assert_eq!(info.role, ShardRole::Replica);
        assert!(info.is_valid_now());
        assert!(validate_for_shard_use(&info));
    }

    #[test]
    fn test_parse_pem_cn_fallback_defaults() {
        // No shard extensions at all: the CN heuristic fills in the
        // identity with read/write over the full token range.
        let params = cert_params("shard-009.themis.local");
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let info = parse_pem(cert.pem().as_bytes()).unwrap();
        assert_eq!(info.shard_id, "shard_009");
        assert_eq!(
            info.capabilities,
            vec![Capability::Read, Capability::Write]
        );
        assert_eq!(info.token_range_start, 0);
        assert_eq!(info.token_range_end, u64::MAX);
        assert_eq!(info.role, ShardRole::Primary);
        assert!(validate_for_shard_use(&info));
    }

    #[test]
    fn test_parse_pem_no_identity_fails_validation() {
        // Neither extensions nor a shard-prefixed CN: parse succeeds but
        // the certificate is unusable for shard identity.
        let params = cert_params("api.themis.local");
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let info = parse_pem(cert.pem().as_bytes()).unwrap();
        assert!(info.shard_id.is_empty());
        assert!(!validate_for_shard_use(&info));
    }

    #[test]
    fn test_verify_against_ca_chain() {
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut ca_dn = DistinguishedName::new();
        ca_dn.push(DnType::CommonName, "themis-cluster-ca");
        ca_params.distinguished_name = ca_dn;
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf = cert_params("shard-001.themis.local")
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .unwrap();

        let info = parse_pem(leaf.pem().as_bytes()).unwrap();
        assert_eq!(info.issuer_cn, "themis-cluster-ca");

        assert!(verify_against_ca(leaf.pem().as_bytes(), ca_cert.pem().as_bytes()).unwrap());

        // A different CA did not sign the leaf.
        let mut other_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut other_dn = DistinguishedName::new();
        other_dn.push(DnType::CommonName, "other-ca");
        other_params.distinguished_name = other_dn;
        other_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let other_key = KeyPair::generate().unwrap();
        let other_ca = other_params.self_signed(&other_key).unwrap();
        assert!(!verify_against_ca(leaf.pem().as_bytes(), other_ca.pem().as_bytes()).unwrap());
    }

    #[test]
    fn test_validate_for_shard_use() {
        assert!(validate_for_shard_use(&valid_info()));
    }

    #[test]
    fn test_validate_rejects_expired() {
        let mut info = valid_info();
        info.not_after = Utc::now() - Duration::days(1);
        assert!(!validate_for_shard_use(&info));

        let mut info = valid_info();
        info.not_before = Utc::now() + Duration::days(1);
        assert!(!validate_for_shard_use(&info));
    }

    #[test]
    fn test_validate_rejects_missing_identity() {
        let mut info = valid_info();
        info.shard_id.clear();
        assert!(!validate_for_shard_use(&info));

        let mut info = valid_info();
        info.capabilities.clear();
        assert!(!validate_for_shard_use(&info));
    }

    #[test]
    fn test_validate_rejects_inverted_token_range() {
        let mut info = valid_info();
        info.token_range_start = 100;
        info.token_range_end = 50;
        assert!(!validate_for_shard_use(&info));

        // Equal bounds are a degenerate but legal range.
        info.token_range_end = 100;
        assert!(validate_for_shard_use(&info));
    }

    #[test]
    fn test_cn_fallback() {
        assert_eq!(
            shard_id_from_cn("shard-001.themis.local").as_deref(),
            Some("shard_001")
        );
        assert_eq!(shard_id_from_cn("shard-0-7").as_deref(), Some("shard_0_7"));
        assert!(shard_id_from_cn("api.themis.local").is_none());
    }

    #[test]
    fn test_parse_capabilities() {
        assert_eq!(
            parse_capabilities("read,write,replicate"),
            vec![Capability::Read, Capability::Write, Capability::Replicate]
        );
        assert_eq!(parse_capabilities("read, admin"), vec![Capability::Read, Capability::Admin]);
        assert!(parse_capabilities("").is_empty());
        assert_eq!(parse_capabilities("read,bogus"), vec![Capability::Read]);
    }

    #[test]
    fn test_serial_hex_strips_sign_padding() {
        assert_eq!(serial_hex(&[0x00, 0xAB, 0xCD]), "ABCD");
        assert_eq!(serial_hex(&[0xAB, 0xCD]), "ABCD");
        assert_eq!(serial_hex(&[0x00]), "00");
    }

    #[test]
    fn test_missing_crl_fails_open() {
        assert!(!is_revoked("ABCD", "/nonexistent/crl.pem"));
    }

    #[test]
    fn test_parse_pem_rejects_garbage() {
        let err = parse_pem(b"not a certificate").unwrap_err();
        assert!(matches!(err, AppError::Parse(ParseErrorKind::CertInvalid, _)));
    }
}
