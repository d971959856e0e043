/// Errors raised while issuing or validating device certificates.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    /// The CSR could not be parsed or carries an unusable subject.
    #[error("invalid certificate signing request: {0}")]
    InvalidCsr(String),

    /// The signing backend (or certificate deployment) failed.
    #[error("signing failed: {0}")]
    SigningFailure(String),

    /// A secure connection announced a device id that was never issued.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The TLS peer does not hold the certificate issued for the device.
    #[error("peer identity does not match device {device_id}: {reason}")]
    IdentityMismatch { device_id: String, reason: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate store: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, CertError>;
