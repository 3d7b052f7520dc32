//! Relay configuration and its fatal-error validation.

use crate::ServerError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Automatic certificate issuance settings. Issuance itself is an external
/// collaborator; the relay only validates the configuration and passes it
/// along.
#[derive(Debug, Clone, Default)]
pub struct AcmeConfig {
    pub enabled: bool,
    pub email: Option<String>,
}

/// OIDC settings for the management surface. All-or-nothing: a partial
/// configuration is a fatal startup error.
#[derive(Debug, Clone, Default)]
pub struct OidcConfig {
    pub issuer: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_url: Option<String>,
}

impl OidcConfig {
    fn is_empty(&self) -> bool {
        self.issuer.is_none()
            && self.client_id.is_none()
            && self.client_secret.is_none()
            && self.redirect_url.is_none()
    }

    fn is_complete(&self) -> bool {
        self.issuer.is_some()
            && self.client_id.is_some()
            && self.client_secret.is_some()
            && self.redirect_url.is_some()
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Management API/UI bind address. The management surface itself is an
    /// external collaborator; the relay core only records the setting.
    pub listen_addr: SocketAddr,
    /// Agent-facing tunnel endpoint bind address.
    pub tunnel_addr: SocketAddr,
    /// Plain HTTP ingress bind address, if HTTP ingress is enabled.
    pub http_addr: Option<SocketAddr>,
    /// HTTPS ingress bind address; requires a certificate provider.
    pub https_addr: Option<SocketAddr>,
    /// Persistence root for the catalog database.
    pub data_dir: PathBuf,
    /// Expected public hostname of this relay.
    pub domain: Option<String>,
    /// Keepalive cadence for the liveness probe.
    pub ping_interval: Duration,
    pub acme: AcmeConfig,
    pub oidc: OidcConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8080).into(),
            tunnel_addr: ([0, 0, 0, 0], 8443).into(),
            http_addr: Some(([0, 0, 0, 0], 80).into()),
            https_addr: None,
            data_dir: PathBuf::from("./data"),
            domain: None,
            ping_interval: burrow_proto::DEFAULT_PING_INTERVAL,
            acme: AcmeConfig::default(),
            oidc: OidcConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reject configurations the relay must not start with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ServerError::Config("data directory is required".to_string()));
        }

        if self.acme.enabled && self.acme.email.as_deref().unwrap_or("").is_empty() {
            return Err(ServerError::Config(
                "acme requires a contact email".to_string(),
            ));
        }

        if !self.oidc.is_empty() && !self.oidc.is_complete() {
            return Err(ServerError::Config(
                "oidc configuration is incomplete: issuer, client id, client secret and redirect url are all required".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn acme_without_email_is_fatal() {
        let mut config = ServerConfig::default();
        config.acme.enabled = true;
        assert!(config.validate().is_err());

        config.acme.email = Some("ops@example.com".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_oidc_is_fatal() {
        let mut config = ServerConfig::default();
        config.oidc.issuer = Some("https://id.example.com".to_string());
        assert!(config.validate().is_err());

        config.oidc.client_id = Some("relay".to_string());
        config.oidc.client_secret = Some("secret".to_string());
        config.oidc.redirect_url = Some("https://relay.example.com/callback".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_data_dir_is_fatal() {
        let mut config = ServerConfig::default();
        config.data_dir = PathBuf::new();
        assert!(config.validate().is_err());
    }
}
