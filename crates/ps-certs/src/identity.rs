use std::fmt::Write as _;
use std::net::IpAddr;

use ring::digest::{digest, SHA256};
use x509_parser::extensions::ParsedExtension;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// Identity presented by a TLS peer in its leaf certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    pub subject_cn: Option<String>,
    pub sans: Vec<String>,
    /// Hex SHA-256 of the certificate DER.
    pub fingerprint: String,
}

impl PeerIdentity {
    /// Parse the leaf certificate. The fingerprint is always filled in, even
    /// when the DER cannot be parsed for a subject.
    pub fn from_der(cert_der: &[u8]) -> Self {
        let fingerprint = sha256_hex(cert_der);
        let Ok((_remaining, cert)) = X509Certificate::from_der(cert_der) else {
            return Self {
                fingerprint,
                ..Self::default()
            };
        };
        let subject_cn = cert
            .subject()
            .iter_common_name()
            .find_map(|name| name.as_str().ok().map(str::to_string));
        Self {
            subject_cn,
            sans: subject_alt_names(&cert),
            fingerprint,
        }
    }
}

/// Fingerprint of the first PEM block in `pem`.
pub fn pem_fingerprint(pem: &str) -> Option<String> {
    let (_rest, block) = parse_x509_pem(pem.as_bytes()).ok()?;
    Some(sha256_hex(&block.contents))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let hash = digest(&SHA256, bytes);
    let mut out = String::with_capacity(64);
    for byte in hash.as_ref() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn subject_alt_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut sans = Vec::new();
    for extension in cert.extensions() {
        let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() else {
            continue;
        };
        for name in &san.general_names {
            let value = match name {
                GeneralName::DNSName(value) | GeneralName::URI(value) => {
                    Some((*value).to_string())
                }
                GeneralName::IPAddress(raw) if raw.len() == 4 => {
                    Some(IpAddr::from([raw[0], raw[1], raw[2], raw[3]]).to_string())
                }
                GeneralName::IPAddress(raw) if raw.len() == 16 => {
                    let mut octets = [0_u8; 16];
                    octets.copy_from_slice(raw);
                    Some(IpAddr::from(octets).to_string())
                }
                _ => None,
            };
            if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
                sans.push(value);
            }
        }
    }
    sans
}
