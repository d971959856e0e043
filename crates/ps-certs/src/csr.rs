use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

use crate::error::{CertError, Result};

const CSR_LABELS: [&str; 2] = ["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];

/// Normalise a CSR received over the wire: devices on some platforms send
/// CRLF line endings and trailing whitespace that openssl rejects.
pub fn sanitize(csr: &str) -> String {
    csr.replace('\r', "").trim().to_string()
}

/// Extract the subject common name (the app bundle id) from a PEM CSR.
pub fn extract_app_name(csr: &str) -> Result<String> {
    let (_rest, pem) = parse_x509_pem(csr.as_bytes())
        .map_err(|e| CertError::InvalidCsr(format!("not a PEM document: {e}")))?;
    if !CSR_LABELS.contains(&pem.label.as_str()) {
        return Err(CertError::InvalidCsr(format!(
            "unexpected PEM label {:?}",
            pem.label
        )));
    }

    let (_rest, request) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| CertError::InvalidCsr(format!("malformed request: {e}")))?;

    let subject = &request.certification_request_info.subject;
    let app_name = subject
        .iter_common_name()
        .find_map(|cn| cn.as_str().ok())
        .ok_or_else(|| CertError::InvalidCsr(format!("no CN in subject {subject}")))?;

    if !is_valid_app_name(app_name) {
        return Err(CertError::InvalidCsr(format!(
            "disallowed characters in app name {app_name:?}"
        )));
    }
    Ok(app_name.to_string())
}

/// App names end up in file paths on the device side, so only word
/// characters, dots and dashes are accepted.
pub fn is_valid_app_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_CSR: &str = include_str!("../tests/fixtures/device.csr");
    const INVALID_CN_CSR: &str = include_str!("../tests/fixtures/invalid_cn.csr");

    #[test]
    fn sanitize_strips_carriage_returns() {
        let crlf = DEVICE_CSR.replace('\n', "\r\n");
        assert_eq!(sanitize(&format!("  {crlf}  ")), DEVICE_CSR.trim());
    }

    #[test]
    fn extracts_bundle_id() {
        assert_eq!(extract_app_name(&sanitize(DEVICE_CSR)).unwrap(), "com.example.app");
    }

    #[test]
    fn rejects_disallowed_cn() {
        let err = extract_app_name(INVALID_CN_CSR).unwrap_err();
        assert!(matches!(err, CertError::InvalidCsr(_)));
        assert!(err.to_string().contains("bad app!"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            extract_app_name("hello"),
            Err(CertError::InvalidCsr(_))
        ));
        let cert = include_str!("../tests/fixtures/device.crt");
        assert!(matches!(
            extract_app_name(cert),
            Err(CertError::InvalidCsr(_))
        ));
    }

    #[test]
    fn app_name_charset() {
        assert!(is_valid_app_name("com.facebook.flipper-sample_2"));
        assert!(!is_valid_app_name(""));
        assert!(!is_valid_app_name("../etc"));
        assert!(!is_valid_app_name("a b"));
    }
}
