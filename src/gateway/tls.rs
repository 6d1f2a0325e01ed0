//! TLS acceptor construction.

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::{PorticoError, Result};

/// Build a TLS acceptor from a PEM certificate chain and private key.
///
/// The acceptor advertises `h2` and `http/1.1` over ALPN.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| {
            PorticoError::Tls(format!("failed to read certificates from {}: {}", cert_path.display(), e))
        })?;

    if certs.is_empty() {
        return Err(PorticoError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
        PorticoError::Tls(format!("failed to read private key from {}: {}", key_path.display(), e))
    })?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!(cert = %cert_path.display(), "Loaded TLS certificate");

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_certificate_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_acceptor(&dir.path().join("cert.pem"), &dir.path().join("key.pem"));

        assert!(matches!(result, Err(PorticoError::Tls(_))));
    }

    #[test]
    fn test_file_without_pem_sections() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        let err = load_acceptor(&cert, &key).err().unwrap();
        assert!(err.to_string().contains("no certificates"));
    }

    fn self_signed(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf, String) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        (cert_path, key_path, key_pair.serialize_pem())
    }

    #[test]
    fn test_loads_valid_certificate_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key, key_pem) = self_signed(dir.path());
        std::fs::write(&key, key_pem).unwrap();

        let acceptor = load_acceptor(&cert, &key).unwrap();

        let alpn = &acceptor.config().alpn_protocols;
        assert_eq!(alpn, &vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_missing_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key, _) = self_signed(dir.path());

        let err = load_acceptor(&cert, &key).err().unwrap();
        assert!(err.to_string().contains("private key"));
    }
}
