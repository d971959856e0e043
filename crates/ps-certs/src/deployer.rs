use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::error::{CertError, Result};

pub const DEVICE_CA_CERT_FILE: &str = "sonarCA.crt";
pub const DEVICE_CLIENT_CERT_FILE: &str = "device.crt";

/// Material handed to a device once its CSR has been signed.
#[derive(Debug, Clone)]
pub struct Deployment<'a> {
    pub device_id: &'a str,
    pub os: &'a str,
    pub app_name: &'a str,
    pub destination: &'a str,
    pub ca_certificate: &'a str,
    pub client_certificate: &'a str,
}

/// Delivers signed certificates to the place the device reads them from.
#[async_trait]
pub trait CertificateDeployer: Send + Sync {
    async fn deploy(&self, deployment: &Deployment<'_>) -> Result<()>;
}

/// Writes the certificates into `destination` on the local filesystem,
/// which is where simulators and desktop apps look for them.
#[derive(Debug, Clone, Default)]
pub struct LocalDirectoryDeployer {
    root: Option<PathBuf>,
}

impl LocalDirectoryDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confine deployments to `root`. Destinations must then be relative and
    /// must not climb out of it.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn target_dir(&self, destination: &str) -> Result<PathBuf> {
        let Some(root) = &self.root else {
            return Ok(PathBuf::from(destination));
        };
        let relative = Path::new(destination);
        let confined = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !confined {
            return Err(CertError::SigningFailure(format!(
                "destination {destination:?} is outside {}",
                root.display()
            )));
        }
        Ok(root.join(relative))
    }
}

#[async_trait]
impl CertificateDeployer for LocalDirectoryDeployer {
    async fn deploy(&self, deployment: &Deployment<'_>) -> Result<()> {
        let dir = self.target_dir(deployment.destination)?;
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(DEVICE_CA_CERT_FILE), deployment.ca_certificate).await?;
        tokio::fs::write(dir.join(DEVICE_CLIENT_CERT_FILE), deployment.client_certificate)
            .await?;
        info!(
            device_id = deployment.device_id,
            app = deployment.app_name,
            dir = %dir.display(),
            "certificates deployed"
        );
        Ok(())
    }
}

/// Leaves delivery to the device itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDeployer;

#[async_trait]
impl CertificateDeployer for NoopDeployer {
    async fn deploy(&self, _deployment: &Deployment<'_>) -> Result<()> {
        Ok(())
    }
}
