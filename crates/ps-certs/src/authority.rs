use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ps_core::types::ClientQuery;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::csr;
use crate::deployer::{CertificateDeployer, Deployment, NoopDeployer};
use crate::error::{CertError, Result};
use crate::identity::{pem_fingerprint, sha256_hex, PeerIdentity};
use crate::signer::SigningBackend;
use crate::store::{CertificateRecord, CertificateStore};

/// Result of a successful bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedDevice {
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

/// Inputs available when minting a device id.
#[derive(Debug, Clone, Copy)]
pub struct DeviceIdRequest<'a> {
    pub csr: &'a str,
    pub app_name: &'a str,
    pub os: &'a str,
    pub destination: &'a str,
}

/// Decides which device id a signed CSR is bound to.
#[async_trait]
pub trait DeviceIdResolver: Send + Sync {
    async fn resolve(&self, request: &DeviceIdRequest<'_>) -> Result<String>;
}

/// Derives the id from the CSR itself, so resubmitting the same CSR yields
/// the same device id.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsrDigestResolver;

#[async_trait]
impl DeviceIdResolver for CsrDigestResolver {
    async fn resolve(&self, request: &DeviceIdRequest<'_>) -> Result<String> {
        let mut digest = sha256_hex(request.csr.as_bytes());
        digest.truncate(16);
        Ok(digest)
    }
}

// ---------------------------------------------------------------------------
// CertificateAuthority
// ---------------------------------------------------------------------------

pub struct CertificateAuthority {
    signer: Arc<dyn SigningBackend>,
    store: Arc<CertificateStore>,
    resolver: Arc<dyn DeviceIdResolver>,
    deployer: Arc<dyn CertificateDeployer>,
    require_known_device: bool,
}

impl CertificateAuthority {
    pub fn new(signer: Arc<dyn SigningBackend>, store: Arc<CertificateStore>) -> Self {
        Self {
            signer,
            store,
            resolver: Arc::new(CsrDigestResolver),
            deployer: Arc::new(NoopDeployer),
            require_known_device: true,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DeviceIdResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_deployer(mut self, deployer: Arc<dyn CertificateDeployer>) -> Self {
        self.deployer = deployer;
        self
    }

    pub fn require_known_device(mut self, require: bool) -> Self {
        self.require_known_device = require;
        self
    }

    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    /// Sign a device CSR and record the identity it was issued for.
    ///
    /// Fails with [`CertError::InvalidCsr`] when the CSR cannot be parsed or
    /// names a disallowed app, and with [`CertError::SigningFailure`] when
    /// signing or delivering the certificate fails.
    pub async fn sign_certificate_signing_request(
        &self,
        csr: &str,
        device_os: &str,
        destination: &str,
    ) -> Result<SignedDevice> {
        let csr = csr::sanitize(csr);
        if csr.is_empty() {
            return Err(CertError::InvalidCsr("empty request".into()));
        }
        let app_name = csr::extract_app_name(&csr)?;
        debug!(app = %app_name, os = device_os, "signing certificate request");

        let client_certificate = self.signer.sign(&csr).await?;
        let ca_certificate = self.signer.ca_certificate().await?;

        let device_id = self
            .resolver
            .resolve(&DeviceIdRequest {
                csr: &csr,
                app_name: &app_name,
                os: device_os,
                destination,
            })
            .await?;

        self.deployer
            .deploy(&Deployment {
                device_id: &device_id,
                os: device_os,
                app_name: &app_name,
                destination,
                ca_certificate: &ca_certificate,
                client_certificate: &client_certificate,
            })
            .await
            .map_err(|e| CertError::SigningFailure(format!("deploying certificates: {e}")))?;

        self.store
            .insert(CertificateRecord {
                device_id: device_id.clone(),
                csr,
                app_name: app_name.clone(),
                os: device_os.to_string(),
                destination: destination.to_string(),
                issued_at: Utc::now(),
                certificate_fingerprint: pem_fingerprint(&client_certificate),
            })
            .await?;

        info!(device_id = %device_id, app = %app_name, os = device_os, "device certificate issued");
        Ok(SignedDevice { device_id })
    }

    /// Decide whether a secure connection may speak for `query.device_id`.
    ///
    /// `peer` is the identity from the TLS handshake, absent only on
    /// transports without client certificates.
    pub fn validate_secure_peer(
        &self,
        query: &ClientQuery,
        peer: Option<&PeerIdentity>,
    ) -> Result<()> {
        let Some(record) = self.store.get(&query.device_id) else {
            if self.require_known_device {
                warn!(device_id = %query.device_id, app = %query.app, "secure connection from unknown device");
                return Err(CertError::UnknownDevice(query.device_id.clone()));
            }
            debug!(device_id = %query.device_id, "admitting device without a certificate record");
            return Ok(());
        };

        let Some(peer) = peer else {
            return Ok(());
        };

        match &record.certificate_fingerprint {
            Some(expected) if *expected != peer.fingerprint => Err(CertError::IdentityMismatch {
                device_id: record.device_id,
                reason: "certificate fingerprint differs from the issued one".into(),
            }),
            Some(_) => Ok(()),
            None if peer.subject_cn.as_deref() == Some(record.app_name.as_str()) => Ok(()),
            None => Err(CertError::IdentityMismatch {
                device_id: record.device_id,
                reason: format!(
                    "certificate subject {:?} does not match app {}",
                    peer.subject_cn, record.app_name
                ),
            }),
        }
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("records", &self.store.len())
            .field("require_known_device", &self.require_known_device)
            .finish()
    }
}
