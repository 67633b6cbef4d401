//! TLS acceptor construction from PEM files.

use std::sync::Arc;

use proto::GatewayError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::TlsFiles;

/// Loads the cert/key pair and builds an acceptor.
///
/// Any read or parse failure is returned as [`GatewayError::Tls`]; the caller
/// decides whether that is fatal.
pub fn load_acceptor(files: &TlsFiles) -> Result<TlsAcceptor, GatewayError> {
    let cert_pem = std::fs::read(&files.cert)
        .map_err(|e| GatewayError::Tls(format!("read {}: {e}", files.cert.display())))?;
    let key_pem = std::fs::read(&files.key)
        .map_err(|e| GatewayError::Tls(format!("read {}: {e}", files.key.display())))?;
    let acceptor = acceptor_from_pem(&cert_pem, &key_pem)?;
    info!(cert = %files.cert.display(), "TLS certificate loaded");
    Ok(acceptor)
}

/// Builds an acceptor from in-memory PEM data.
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, GatewayError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e: std::io::Error| GatewayError::Tls(e.to_string()))?;
    if certs.is_empty() {
        return Err(GatewayError::Tls("No certificate found".into()));
    }
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_pem))
        .map_err(|e: std::io::Error| GatewayError::Tls(e.to_string()))?
        .ok_or_else(|| GatewayError::Tls("No private key found".into()))?;

    Ok(TlsAcceptor::from(make_server_config(certs, key)?))
}

/// Builds a rustls server config from DER certificates and private key.
fn make_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<rustls::ServerConfig>, GatewayError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| GatewayError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Tls(e.to_string()))?;
    Ok(Arc::new(tls_config))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_acceptor_accepts_generated_pem() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let files = test_support::write_self_signed(tmp.path());
        load_acceptor(&files).expect("valid generated cert should load");
    }

    #[test]
    fn load_acceptor_reports_missing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let files = TlsFiles {
            cert: tmp.path().join("missing-cert.pem"),
            key: tmp.path().join("missing-key.pem"),
        };
        let err = load_acceptor(&files).err().expect("missing files must fail");
        assert!(matches!(err, GatewayError::Tls(_)));
        assert!(err.to_string().contains("missing-cert.pem"));
    }

    #[test]
    fn acceptor_from_pem_rejects_invalid_pem() {
        let err = acceptor_from_pem(b"invalid cert", b"invalid key").err().expect("invalid pem");
        assert!(err.to_string().contains("TLS error"));
    }
}
