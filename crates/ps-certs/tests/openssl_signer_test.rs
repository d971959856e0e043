//! Exercises the real `openssl` binary; each test returns early when it is
//! not installed.

use ps_certs::signer::{check_not_expiring, OpensslSigner, SigningBackend};

const DEVICE_CSR: &str = include_str!("fixtures/device.csr");

async fn signer(dir: &std::path::Path) -> Option<OpensslSigner> {
    let signer = OpensslSigner::new("openssl", dir);
    if signer.is_available().await {
        Some(signer)
    } else {
        eprintln!("openssl not installed, skipping");
        None
    }
}

#[tokio::test]
async fn creates_and_reuses_server_certificates() {
    let dir = tempfile::tempdir().unwrap();
    let Some(signer) = signer(dir.path()).await else {
        return;
    };

    signer.ensure_server_certificates().await.unwrap();
    let paths = signer.paths();
    for path in [paths.ca_key(), paths.ca_cert(), paths.server_key(), paths.server_cert()] {
        assert!(path.exists(), "{} missing", path.display());
    }
    check_not_expiring(&paths.server_cert()).await.unwrap();

    let before = std::fs::read(paths.server_cert()).unwrap();
    signer.ensure_server_certificates().await.unwrap();
    assert_eq!(std::fs::read(paths.server_cert()).unwrap(), before);
}

#[tokio::test]
async fn regenerates_missing_server_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let Some(signer) = signer(dir.path()).await else {
        return;
    };
    signer.ensure_server_certificates().await.unwrap();
    let ca_before = std::fs::read(signer.paths().ca_cert()).unwrap();

    std::fs::remove_file(signer.paths().server_cert()).unwrap();
    signer.ensure_server_certificates().await.unwrap();

    assert!(signer.paths().server_cert().exists());
    assert_eq!(std::fs::read(signer.paths().ca_cert()).unwrap(), ca_before);
}

#[tokio::test]
async fn signs_device_csr() {
    let dir = tempfile::tempdir().unwrap();
    let Some(signer) = signer(dir.path()).await else {
        return;
    };
    signer.ensure_server_certificates().await.unwrap();

    let cert = signer.sign(DEVICE_CSR.trim()).await.unwrap();
    assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
    let ca = signer.ca_certificate().await.unwrap();
    assert!(ca.contains("BEGIN CERTIFICATE"));

    // Scratch files are cleaned up.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn garbage_csr_fails_signing() {
    let dir = tempfile::tempdir().unwrap();
    let Some(signer) = signer(dir.path()).await else {
        return;
    };
    signer.ensure_server_certificates().await.unwrap();
    assert!(signer.sign("garbage").await.is_err());
}
