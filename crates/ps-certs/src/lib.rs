//! Device trust bootstrap.
//!
//! A device proves who it is by submitting a certificate signing request on
//! the insecure endpoint. [`CertificateAuthority`] validates the CSR, signs
//! it with the local CA, deploys the result and records the issued identity
//! so the secure endpoint can later admit the device.

pub mod authority;
pub mod csr;
pub mod deployer;
pub mod error;
pub mod identity;
pub mod signer;
pub mod store;

pub use authority::{CertificateAuthority, SignedDevice};
pub use error::{CertError, Result};
pub use identity::PeerIdentity;
