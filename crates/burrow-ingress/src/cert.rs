//! Certificate provider seam for TLS-terminating ingress.
//!
//! Issuance itself (ACME or otherwise) lives outside this crate; the
//! ingress only asks for a ready-to-serve rustls config per domain.

use crate::IngressError;
use async_trait::async_trait;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Resolves a server TLS configuration for a domain.
#[async_trait]
pub trait CertProvider: Send + Sync {
    async fn server_config(&self, domain: &str) -> Result<Arc<rustls::ServerConfig>, IngressError>;
}

/// Serves one certificate for every domain, loaded from PEM files.
pub struct StaticCertProvider {
    config: Arc<rustls::ServerConfig>,
}

impl StaticCertProvider {
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, IngressError> {
        ensure_crypto_provider();

        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| IngressError::Certificate(format!("invalid cert/key: {e}")))?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn from_config(config: Arc<rustls::ServerConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CertProvider for StaticCertProvider {
    async fn server_config(&self, _domain: &str) -> Result<Arc<rustls::ServerConfig>, IngressError> {
        Ok(self.config.clone())
    }
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, IngressError> {
    let file = File::open(path)
        .map_err(|e| IngressError::Certificate(format!("failed to open cert file: {e}")))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| IngressError::Certificate(format!("failed to parse certs: {e}")))
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, IngressError> {
    let file = File::open(path)
        .map_err(|e| IngressError::Certificate(format!("failed to open key file: {e}")))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| IngressError::Certificate(format!("failed to parse key: {e}")))?
        .ok_or_else(|| IngressError::Certificate("no private key found".to_string()))
}
