use std::sync::Arc;

use async_trait::async_trait;
use ps_certs::authority::{DeviceIdRequest, DeviceIdResolver};
use ps_certs::deployer::{LocalDirectoryDeployer, DEVICE_CA_CERT_FILE, DEVICE_CLIENT_CERT_FILE};
use ps_certs::identity::pem_fingerprint;
use ps_certs::signer::SigningBackend;
use ps_certs::store::CertificateStore;
use ps_certs::{CertError, CertificateAuthority, PeerIdentity};
use ps_core::types::ClientQuery;

const CA_CERT: &str = include_str!("fixtures/ca.crt");
const DEVICE_CSR: &str = include_str!("fixtures/device.csr");
const DEVICE_CERT: &str = include_str!("fixtures/device.crt");
const INTRUDER_CERT: &str = include_str!("fixtures/intruder.crt");
const INVALID_CN_CSR: &str = include_str!("fixtures/invalid_cn.csr");

/// Hands back the pre-signed fixture certificate.
struct FixtureSigner;

#[async_trait]
impl SigningBackend for FixtureSigner {
    async fn sign(&self, _csr: &str) -> ps_certs::Result<String> {
        Ok(DEVICE_CERT.to_string())
    }

    async fn ca_certificate(&self) -> ps_certs::Result<String> {
        Ok(CA_CERT.to_string())
    }
}

struct BrokenSigner;

#[async_trait]
impl SigningBackend for BrokenSigner {
    async fn sign(&self, _csr: &str) -> ps_certs::Result<String> {
        Err(CertError::SigningFailure("ca key missing".into()))
    }

    async fn ca_certificate(&self) -> ps_certs::Result<String> {
        Err(CertError::SigningFailure("ca key missing".into()))
    }
}

struct FixedId(&'static str);

#[async_trait]
impl DeviceIdResolver for FixedId {
    async fn resolve(&self, _request: &DeviceIdRequest<'_>) -> ps_certs::Result<String> {
        Ok(self.0.to_string())
    }
}

fn authority() -> CertificateAuthority {
    CertificateAuthority::new(Arc::new(FixtureSigner), Arc::new(CertificateStore::in_memory()))
        .with_resolver(Arc::new(FixedId("D1")))
}

fn peer(pem: &str) -> PeerIdentity {
    PeerIdentity {
        subject_cn: Some("com.example.app".into()),
        sans: Vec::new(),
        fingerprint: pem_fingerprint(pem).unwrap(),
    }
}

fn query(device_id: &str) -> ClientQuery {
    ClientQuery::new("Example", "Android", "Pixel", device_id)
}

#[tokio::test]
async fn signing_records_the_device() {
    let ca = authority();
    let signed = ca
        .sign_certificate_signing_request(DEVICE_CSR, "Android", "/sdcard/periscope")
        .await
        .unwrap();
    assert_eq!(signed.device_id, "D1");

    let record = ca.store().get("D1").expect("record persisted");
    assert_eq!(record.app_name, "com.example.app");
    assert_eq!(record.os, "Android");
    assert_eq!(record.destination, "/sdcard/periscope");
    assert_eq!(record.csr, DEVICE_CSR.trim());
    assert_eq!(record.certificate_fingerprint, pem_fingerprint(DEVICE_CERT));
}

#[tokio::test]
async fn default_resolver_is_stable_per_csr() {
    let ca = CertificateAuthority::new(
        Arc::new(FixtureSigner),
        Arc::new(CertificateStore::in_memory()),
    );
    let first = ca
        .sign_certificate_signing_request(DEVICE_CSR, "iOS", "")
        .await
        .unwrap();
    let crlf = DEVICE_CSR.replace('\n', "\r\n");
    let second = ca.sign_certificate_signing_request(&crlf, "iOS", "").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.device_id.len(), 16);
    assert_eq!(ca.store().len(), 1);
}

#[tokio::test]
async fn invalid_csr_is_rejected_without_record() {
    let ca = authority();
    for csr in ["", "   \r\n", "not a csr", INVALID_CN_CSR] {
        let err = ca
            .sign_certificate_signing_request(csr, "Android", "")
            .await
            .unwrap_err();
        assert!(matches!(err, CertError::InvalidCsr(_)), "{csr:?} gave {err}");
    }
    assert!(ca.store().is_empty());
}

#[tokio::test]
async fn backend_failure_is_signing_failure() {
    let ca = CertificateAuthority::new(
        Arc::new(BrokenSigner),
        Arc::new(CertificateStore::in_memory()),
    );
    let err = ca
        .sign_certificate_signing_request(DEVICE_CSR, "Android", "")
        .await
        .unwrap_err();
    assert!(matches!(err, CertError::SigningFailure(_)));
    assert!(ca.store().is_empty());
}

#[tokio::test]
async fn local_deployer_writes_device_files() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority().with_deployer(Arc::new(LocalDirectoryDeployer::rooted_at(dir.path())));
    ca.sign_certificate_signing_request(DEVICE_CSR, "iOS", "sandbox/certs")
        .await
        .unwrap();

    let target = dir.path().join("sandbox/certs");
    assert_eq!(
        std::fs::read_to_string(target.join(DEVICE_CA_CERT_FILE)).unwrap(),
        CA_CERT
    );
    assert_eq!(
        std::fs::read_to_string(target.join(DEVICE_CLIENT_CERT_FILE)).unwrap(),
        DEVICE_CERT
    );
}

#[tokio::test]
async fn rooted_deployer_refuses_escaping_destinations() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    let ca = authority().with_deployer(Arc::new(LocalDirectoryDeployer::rooted_at(&root)));

    let outside = dir.path().join("outside");
    for destination in [outside.to_str().unwrap(), "../outside"] {
        let err = ca
            .sign_certificate_signing_request(DEVICE_CSR, "iOS", destination)
            .await
            .unwrap_err();
        assert!(matches!(err, CertError::SigningFailure(_)));
    }
    assert!(!outside.exists());
    assert!(ca.store().is_empty());
}

#[tokio::test]
async fn deploy_failure_is_signing_failure() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the destination directory should go.
    let blocker = dir.path().join("blocked");
    std::fs::write(&blocker, "").unwrap();

    let ca = authority().with_deployer(Arc::new(LocalDirectoryDeployer::new()));
    let err = ca
        .sign_certificate_signing_request(DEVICE_CSR, "iOS", blocker.to_str().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, CertError::SigningFailure(_)));
    assert!(ca.store().is_empty());
}

// ---------------------------------------------------------------------------
// Secure peer validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn issued_certificate_is_admitted() {
    let ca = authority();
    ca.sign_certificate_signing_request(DEVICE_CSR, "Android", "")
        .await
        .unwrap();
    ca.validate_secure_peer(&query("D1"), Some(&peer(DEVICE_CERT)))
        .expect("issued certificate admitted");
    ca.validate_secure_peer(&query("D1"), None)
        .expect("known device without tls admitted");
}

#[tokio::test]
async fn other_certificate_for_known_device_is_mismatch() {
    let ca = authority();
    ca.sign_certificate_signing_request(DEVICE_CSR, "Android", "")
        .await
        .unwrap();
    let err = ca
        .validate_secure_peer(&query("D1"), Some(&peer(INTRUDER_CERT)))
        .unwrap_err();
    assert!(matches!(err, CertError::IdentityMismatch { ref device_id, .. } if device_id == "D1"));
}

#[tokio::test]
async fn unknown_device_policy() {
    let strict = authority();
    assert!(matches!(
        strict.validate_secure_peer(&query("nobody"), Some(&peer(DEVICE_CERT))),
        Err(CertError::UnknownDevice(id)) if id == "nobody"
    ));

    let lenient = authority().require_known_device(false);
    lenient
        .validate_secure_peer(&query("nobody"), Some(&peer(DEVICE_CERT)))
        .expect("lenient authority admits unknown devices");
}
