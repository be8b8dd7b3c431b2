//! Certificate loading for the terminated path
//!
//! The gateway serves a single static certificate. Its resolver only hands
//! the certificate out when the TLS-layer SNI names the gateway's own
//! hostname, so a client that passed the ECH public-name check with a
//! different SNI still fails the handshake.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};

/// Load a PEM certificate chain and private key from disk.
pub fn load_certified_key(
    cert_path: &Path,
    key_path: &Path,
    provider: &CryptoProvider,
) -> Result<CertifiedKey> {
    let cert_pem = fs::read(cert_path).map_err(|e| {
        GatewayError::Certificate(format!("Failed to read {}: {}", cert_path.display(), e))
    })?;
    let key_pem = fs::read(key_path).map_err(|e| {
        GatewayError::Certificate(format!("Failed to read {}: {}", key_path.display(), e))
    })?;

    let key = certified_key_from_pem(&cert_pem, &key_pem, provider)?;
    info!("Loaded certificate from {}", cert_path.display());
    Ok(key)
}

/// Build a [`CertifiedKey`] from PEM text.
pub fn certified_key_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
    provider: &CryptoProvider,
) -> Result<CertifiedKey> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| GatewayError::Certificate(format!("Failed to parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(GatewayError::Certificate(
            "no certificate found in PEM".to_string(),
        ));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| GatewayError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| GatewayError::Certificate("no private key found in PEM".to_string()))?;
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| GatewayError::Certificate(format!("Unsupported private key: {}", e)))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Serves one certificate, only to clients asking for `hostname`.
#[derive(Debug)]
pub struct GatewayCertResolver {
    hostname: String,
    key: Arc<CertifiedKey>,
}

impl GatewayCertResolver {
    pub fn new(hostname: impl Into<String>, key: Arc<CertifiedKey>) -> Self {
        Self {
            hostname: hostname.into(),
            key,
        }
    }
}

impl ResolvesServerCert for GatewayCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) if name.eq_ignore_ascii_case(&self.hostname) => Some(self.key.clone()),
            other => {
                warn!(
                    "Rejecting TLS handshake due to disallowed SNI: {:?}",
                    other.unwrap_or_default()
                );
                None
            }
        }
    }
}

/// TLS server config for the terminated path: SNI-checked certificate,
/// ALPN offering HTTP/2 then HTTP/1.1.
pub fn build_server_config(
    hostname: &str,
    key: Arc<CertifiedKey>,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(GatewayCertResolver::new(hostname, key)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
