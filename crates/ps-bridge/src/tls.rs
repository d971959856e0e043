use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use ps_certs::PeerIdentity;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::private_key;
use tokio_rustls::server::TlsStream;

/// Server config for the secure endpoint: presents `cert_path`/`key_path`
/// and requires a client certificate issued by the CA in `ca_path`.
pub fn build_server_config(cert_path: &Path, key_path: &Path, ca_path: &Path) -> io::Result<Arc<ServerConfig>> {
    let chain = load_cert_chain(cert_path)?;
    let key = load_private_key(key_path)?;
    let roots = load_root_store(ca_path)?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("client verifier from {}: {err}", ca_path.display()),
            )
        })?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid server certificate or key: {err}"),
            )
        })?;
    Ok(Arc::new(config))
}

/// Client config presenting a device certificate, trusting only `ca_path`.
pub fn build_client_config(ca_path: &Path, cert_path: &Path, key_path: &Path) -> io::Result<Arc<ClientConfig>> {
    let roots = load_root_store(ca_path)?;
    let chain = load_cert_chain(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid client certificate or key: {err}"),
            )
        })?;
    Ok(Arc::new(config))
}

pub fn server_name(host: &str) -> io::Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, format!("{host}: {err}")))
}

pub fn load_cert_chain(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certificates = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("PEM certificates in {}: {err}", path.display()),
            )
        })?;
    if certificates.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no certificates in {}", path.display()),
        ));
    }
    Ok(certificates)
}

pub fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    private_key(&mut reader)
        .map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("private key {}: {err}", path.display()),
            )
        })?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no private key in {}", path.display()),
            )
        })
}

pub fn load_root_store(path: &Path) -> io::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(load_cert_chain(path)?);
    if added == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no usable CA certificate in {}", path.display()),
        ));
    }
    Ok(roots)
}

/// Identity from the leaf certificate the client presented, if any.
pub fn peer_identity<IO>(stream: &TlsStream<IO>) -> Option<PeerIdentity> {
    let (_io, session) = stream.get_ref();
    let leaf = session.peer_certificates()?.first()?;
    Some(PeerIdentity::from_der(leaf.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../ps-certs/tests/fixtures")
            .join(name)
    }

    #[test]
    fn builds_server_config_from_fixtures() {
        build_server_config(&fixture("server.crt"), &fixture("server.key"), &fixture("ca.crt")).unwrap();
    }

    #[test]
    fn builds_client_config_from_fixtures() {
        build_client_config(&fixture("ca.crt"), &fixture("device.crt"), &fixture("device.key")).unwrap();
    }

    #[test]
    fn missing_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.key");
        std::fs::write(&empty, "").unwrap();
        let err = load_private_key(&empty).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn certificate_file_without_pem_blocks_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let junk = dir.path().join("junk.crt");
        std::fs::write(&junk, "not a certificate").unwrap();
        assert!(load_cert_chain(&junk).is_err());
        assert!(load_root_store(&junk).is_err());
    }
}
