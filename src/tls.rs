//! Certificate loading for the HTTPS listener

use crate::config::HttpsConfig;
use crate::error::{GatewayError, Result};
use crate::paths;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Names the generated certificate is valid for
const SELF_SIGNED_NAMES: &[&str] = &["localhost", "127.0.0.1"];

type CertChain = Vec<CertificateDer<'static>>;

/// Build the acceptor for the HTTPS listener. Without both a certificate
/// and a key a self-signed certificate for localhost is generated.
pub fn acceptor(https: &HttpsConfig) -> Result<TlsAcceptor> {
    let (certs, key) = if https.has_files() {
        let cert_path = paths::normalize(&https.cert, true);
        let key_path = paths::normalize(&https.key, true);
        let pair = (load_certs(&cert_path)?, load_key(&key_path)?);
        info!(cert = %cert_path.display(), key = %key_path.display(), "Serving HTTPS with configured certificate");
        pair
    } else {
        let pair = self_signed()?;
        warn!(names = ?SELF_SIGNED_NAMES, "Serving HTTPS with a generated self-signed certificate");
        pair
    };

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Tls(format!("certificate and key do not form a usable pair: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn open_pem(path: &Path, what: &str) -> Result<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| {
        GatewayError::Tls(format!("Failed to open {} file {}: {}", what, path.display(), e))
    })
}

/// Every certificate in a PEM file, leaf first
pub fn load_certs(path: &Path) -> Result<CertChain> {
    let mut reader = open_pem(path, "certificate")?;
    let certs: CertChain = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<_>>()
        .map_err(|e| GatewayError::Tls(format!("Invalid PEM in {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(GatewayError::Tls(format!("No certificates found in {}", path.display())));
    }
    Ok(certs)
}

/// The first PKCS#1, PKCS#8 or SEC1 key in a PEM file
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open_pem(path, "key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| GatewayError::Tls(format!("Invalid PEM in {}: {}", path.display(), e)))?
        .ok_or_else(|| GatewayError::Tls(format!("No private key found in {}", path.display())))
}

fn self_signed() -> Result<(CertChain, PrivateKeyDer<'static>)> {
    let names: Vec<String> = SELF_SIGNED_NAMES.iter().map(|name| name.to_string()).collect();
    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(names)
        .map_err(|e| GatewayError::Tls(format!("Failed to generate self-signed certificate: {}", e)))?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| GatewayError::Tls(format!("Generated key is unusable: {}", e)))?;

    Ok((vec![cert.der().clone()], key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pem_pair(dir: &Path) -> (String, String) {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
        (
            cert_path.to_string_lossy().into_owned(),
            key_path.to_string_lossy().into_owned(),
        )
    }

    #[test]
    fn test_load_cert_and_key_files() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_pem_pair(dir.path());

        assert_eq!(load_certs(Path::new(&cert)).unwrap().len(), 1);
        assert!(matches!(
            load_key(Path::new(&key)).unwrap(),
            PrivateKeyDer::Pkcs8(_)
        ));

        let https = HttpsConfig {
            enabled: true,
            cert,
            key,
            no_http: false,
        };
        assert!(acceptor(&https).is_ok());
    }

    #[test]
    fn test_missing_cert_file() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(err.to_string().contains("Failed to open certificate file"));
    }

    #[test]
    fn test_cert_file_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let (_, key) = write_pem_pair(dir.path());

        let err = load_certs(Path::new(&key)).unwrap_err();
        assert!(err.to_string().contains("No certificates found"));
    }

    #[test]
    fn test_key_file_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _) = write_pem_pair(dir.path());

        let err = load_key(Path::new(&cert)).unwrap_err();
        assert!(err.to_string().contains("No private key found"));
    }

    #[test]
    fn test_self_signed_fallback() {
        let (certs, _) = self_signed().unwrap();
        assert_eq!(certs.len(), 1);

        let https = HttpsConfig {
            enabled: true,
            ..HttpsConfig::default()
        };
        assert!(acceptor(&https).is_ok());
    }
}
