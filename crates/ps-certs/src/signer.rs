use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{CertError, Result};

/// Certificates expiring within this window are regenerated.
const MIN_EXPIRY_WINDOW_SECS: i64 = 24 * 60 * 60;

const CA_SUBJECT: &str = "/O=Periscope/CN=PeriscopeCA";
const SERVER_SUBJECT: &str = "/O=Periscope/CN=localhost";
const CA_VALIDITY_DAYS: &str = "3650";
const LEAF_VALIDITY_DAYS: &str = "825";

const CLIENT_EXTENSIONS: &str = "basicConstraints=CA:FALSE\n\
     keyUsage=critical,digitalSignature,keyEncipherment\n\
     extendedKeyUsage=clientAuth\n";
const SERVER_EXTENSIONS: &str = "subjectAltName=DNS:localhost,IP:127.0.0.1\n\
     basicConstraints=CA:FALSE\n\
     keyUsage=critical,digitalSignature,keyEncipherment\n\
     extendedKeyUsage=serverAuth\n";

/// Backend that turns a device CSR into a signed certificate.
#[async_trait]
pub trait SigningBackend: Send + Sync {
    /// Sign a sanitised PEM CSR, returning the PEM certificate.
    async fn sign(&self, csr: &str) -> Result<String>;

    /// PEM certificate of the issuing CA, deployed next to device certificates.
    async fn ca_certificate(&self) -> Result<String>;
}

/// On-disk layout of the local CA and the server's TLS identity.
#[derive(Debug, Clone)]
pub struct CertificatePaths {
    pub dir: PathBuf,
}

impl CertificatePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn ca_key(&self) -> PathBuf {
        self.dir.join("ca.key")
    }
    pub fn ca_cert(&self) -> PathBuf {
        self.dir.join("ca.crt")
    }
    pub fn server_key(&self) -> PathBuf {
        self.dir.join("server.key")
    }
    pub fn server_csr(&self) -> PathBuf {
        self.dir.join("server.csr")
    }
    pub fn server_cert(&self) -> PathBuf {
        self.dir.join("server.crt")
    }
    pub fn serial(&self) -> PathBuf {
        self.dir.join("server.srl")
    }
    pub fn records(&self) -> PathBuf {
        self.dir.join("records.json")
    }
}

// ---------------------------------------------------------------------------
// OpensslSigner
// ---------------------------------------------------------------------------

/// Signs CSRs by shelling out to the `openssl` binary.
///
/// Each invocation runs as a child process awaited on the runtime, so a slow
/// signature never holds up frames on other connections. Invocations that
/// touch the CA serial file are serialised.
#[derive(Debug)]
pub struct OpensslSigner {
    openssl: PathBuf,
    paths: CertificatePaths,
    ca_lock: Mutex<()>,
}

impl OpensslSigner {
    pub fn new(openssl: impl Into<PathBuf>, dir: impl Into<PathBuf>) -> Self {
        Self {
            openssl: openssl.into(),
            paths: CertificatePaths::new(dir),
            ca_lock: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &CertificatePaths {
        &self.paths
    }

    /// True when the configured binary can be executed.
    pub async fn is_available(&self) -> bool {
        let mut cmd = self.command();
        cmd.arg("version");
        self.execute(cmd).await.is_ok()
    }

    /// Make sure a CA and a server certificate issued by it exist, are not
    /// about to expire, and belong together. Anything missing or stale is
    /// regenerated.
    pub async fn ensure_server_certificates(&self) -> Result<()> {
        let _guard = self.ca_lock.lock().await;
        tokio::fs::create_dir_all(&self.paths.dir).await?;

        let ca_fresh = self.paths.ca_key().exists()
            && check_not_expiring(&self.paths.ca_cert()).await.is_ok();
        if !ca_fresh {
            info!(dir = %self.paths.dir.display(), "generating new certificate authority");
            self.generate_ca().await?;
            return self.generate_server_certificate().await;
        }

        let server_files = [self.paths.server_key(), self.paths.server_cert()];
        if !server_files.iter().all(|p| p.exists()) {
            info!("no server certificate found, generating a new one");
            return self.generate_server_certificate().await;
        }

        if let Err(e) = self.check_server_certificate().await {
            warn!(error = %e, "server certificate is not valid, generating a new one");
            return self.generate_server_certificate().await;
        }

        debug!("existing server certificates are valid");
        Ok(())
    }

    async fn check_server_certificate(&self) -> Result<()> {
        check_not_expiring(&self.paths.server_cert()).await?;
        let mut cmd = self.command();
        cmd.arg("verify")
            .arg("-CAfile")
            .arg(self.paths.ca_cert())
            .arg(self.paths.server_cert());
        let output = self.execute(cmd).await?;
        if !output.trim_end().ends_with(": OK") {
            return Err(CertError::SigningFailure(
                "server certificate was not issued by the current CA".into(),
            ));
        }
        Ok(())
    }

    async fn generate_rsa_key(&self, path: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("genrsa").arg("-out").arg(path).arg("2048");
        self.execute(cmd).await.map(|_| ())
    }

    async fn generate_ca(&self) -> Result<()> {
        self.generate_rsa_key(&self.paths.ca_key()).await?;
        let mut cmd = self.command();
        cmd.args(["req", "-new", "-x509", "-days", CA_VALIDITY_DAYS])
            .args(["-subj", CA_SUBJECT])
            .args(["-addext", "basicConstraints=critical,CA:TRUE"])
            .args(["-addext", "keyUsage=critical,keyCertSign,cRLSign"])
            .arg("-key")
            .arg(self.paths.ca_key())
            .arg("-out")
            .arg(self.paths.ca_cert());
        self.execute(cmd).await.map(|_| ())
    }

    async fn generate_server_certificate(&self) -> Result<()> {
        self.generate_rsa_key(&self.paths.server_key()).await?;
        let mut cmd = self.command();
        cmd.args(["req", "-new", "-subj", SERVER_SUBJECT])
            .arg("-key")
            .arg(self.paths.server_key())
            .arg("-out")
            .arg(self.paths.server_csr());
        self.execute(cmd).await?;

        let pem = self.issue(&self.paths.server_csr(), SERVER_EXTENSIONS).await?;
        let cert = self.paths.server_cert();
        tokio::fs::write(&cert, pem).await?;
        info!(cert = %cert.display(), "server certificate generated");
        Ok(())
    }

    /// Sign the request at `csr` with the CA, returning the PEM certificate.
    async fn issue(&self, csr: &Path, extensions: &str) -> Result<String> {
        let ext = ScratchFile::write(&self.paths.dir, "ext", extensions).await?;
        let mut cmd = self.command();
        cmd.args(["x509", "-req", "-CAcreateserial", "-days", LEAF_VALIDITY_DAYS])
            .arg("-in")
            .arg(csr)
            .arg("-CA")
            .arg(self.paths.ca_cert())
            .arg("-CAkey")
            .arg(self.paths.ca_key())
            .arg("-CAserial")
            .arg(self.paths.serial())
            .arg("-extfile")
            .arg(ext.path());
        self.execute(cmd).await
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.openssl);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn execute(&self, mut cmd: Command) -> Result<String> {
        let output = cmd.output().await.map_err(|e| {
            CertError::SigningFailure(format!("failed to run {}: {e}", self.openssl.display()))
        })?;
        if !output.status.success() {
            return Err(CertError::SigningFailure(format!(
                "openssl exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SigningBackend for OpensslSigner {
    async fn sign(&self, csr: &str) -> Result<String> {
        let _guard = self.ca_lock.lock().await;
        let request = ScratchFile::write(&self.paths.dir, "csr", &format!("{csr}\n")).await?;
        debug!(path = %request.path().display(), "signing device certificate");
        self.issue(request.path(), CLIENT_EXTENSIONS).await
    }

    async fn ca_certificate(&self) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.paths.ca_cert()).await?)
    }
}

/// Fails when the PEM certificate at `path` expires within a day.
pub async fn check_not_expiring(path: &Path) -> Result<()> {
    let pem = tokio::fs::read(path).await?;
    let (_rest, block) = parse_x509_pem(&pem)
        .map_err(|e| CertError::Store(format!("{}: not a PEM file: {e}", path.display())))?;
    let (_rest, cert) = X509Certificate::from_der(&block.contents)
        .map_err(|e| CertError::Store(format!("{}: {e}", path.display())))?;

    let not_after = cert.validity().not_after.timestamp();
    let deadline = chrono::Utc::now().timestamp() + MIN_EXPIRY_WINDOW_SECS;
    if not_after <= deadline {
        return Err(CertError::Store(format!(
            "{} has expired or expires within a day",
            path.display()
        )));
    }
    Ok(())
}

/// Temporary file removed on drop.
struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    async fn write(dir: &Path, extension: &str, contents: &str) -> Result<Self> {
        let path = dir.join(format!(".{}.{extension}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, contents).await?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
