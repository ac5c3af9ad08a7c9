//! TLS provisioning for the listener
//!
//! Certificates and keys are PEM files; ALPN offers `h2` ahead of
//! `http/1.1` so capable clients multiplex tunnels over one connection.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::{ProxyError, Result};

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Build a rustls server configuration from PEM files
pub fn load_server_config(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<ServerConfig> {
    let certs = load_certs(cert_path.as_ref())?;
    let key = load_private_key(key_path.as_ref())?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(format!("Failed to select protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("Failed to build TLS configuration: {e}")))?;

    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];
    Ok(config)
}

/// Create TLS acceptor from certificate and key files
pub fn acceptor(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<TlsAcceptor> {
    let config = load_server_config(cert_path, key_path)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        ProxyError::Tls(format!("Failed to open certificate file '{}': {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| {
            ProxyError::Tls(format!("Failed to parse certificate file '{}': {e}", path.display()))
        })?;

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "No certificates found in certificate file: {}",
            path.display()
        )));
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        ProxyError::Tls(format!("Failed to open private key file '{}': {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);

    // PKCS#8, PKCS#1 and SEC1 keys are all accepted
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            ProxyError::Tls(format!("Failed to parse private key file '{}': {e}", path.display()))
        })?
        .ok_or_else(|| ProxyError::Tls(format!("No private key found in key file: {}", path.display())))
}


#[cfg(test)]
mod tests {
    use super::test_support::{connector, localhost, testdata};
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_load_server_config_sets_alpn() {
        let config = load_server_config(testdata("server.pem"), testdata("server.key")).unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_missing_files_are_tls_errors() {
        let err = load_server_config(testdata("missing.pem"), testdata("server.key")).unwrap_err();
        assert!(matches!(err, ProxyError::Tls(ref msg) if msg.contains("missing.pem")));

        let err = load_server_config(testdata("server.pem"), testdata("missing.key")).unwrap_err();
        assert!(matches!(err, ProxyError::Tls(ref msg) if msg.contains("missing.key")));
    }

    #[test]
    fn test_swapped_files_are_rejected() {
        // A key file holds no certificates and a certificate file holds no key.
        let err = load_server_config(testdata("server.key"), testdata("server.key")).unwrap_err();
        assert!(matches!(err, ProxyError::Tls(ref msg) if msg.contains("No certificates")));

        let err = load_server_config(testdata("server.pem"), testdata("server.pem")).unwrap_err();
        assert!(matches!(err, ProxyError::Tls(ref msg) if msg.contains("No private key")));
    }

    #[tokio::test]
    async fn test_handshake_negotiates_h2() {
        let acceptor = acceptor(testdata("server.pem"), testdata("server.key")).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(stream).await.unwrap();
            let alpn = tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
            tls.write_all(b"ok").await.unwrap();
            tls.shutdown().await.unwrap();
            alpn
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut tls = connector(&[ALPN_H2, ALPN_HTTP11])
            .connect(localhost(), stream)
            .await
            .unwrap();
        let mut reply = Vec::new();
        tls.read_to_end(&mut reply).await.unwrap();

        assert_eq!(reply, b"ok");
        assert_eq!(server.await.unwrap(), Some(b"h2".to_vec()));
    }
}
