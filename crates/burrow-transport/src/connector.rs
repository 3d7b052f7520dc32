//! Agent-side tunnel dialer.

use crate::framed::{BoxedIo, WsStream};
use crate::{TransportError, HANDSHAKE_TIMEOUT, TUNNEL_PATH, TUNNEL_SUBPROTOCOL};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

/// How the agent reaches the relay's tunnel endpoint.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Relay address in `host:port` form.
    pub server_addr: String,
    /// Bearer token for this tunnel.
    pub token: String,
    /// Dial `ws://` instead of `wss://`.
    pub plaintext: bool,
    /// Skip server certificate verification.
    pub insecure: bool,
}

/// Dial the relay and complete the WebSocket upgrade.
pub async fn connect(opts: &ConnectOptions) -> Result<WsStream, TransportError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, dial(opts))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)?
}

async fn dial(opts: &ConnectOptions) -> Result<WsStream, TransportError> {
    let host = opts
        .server_addr
        .rsplit_once(':')
        .map(|(h, _)| h)
        .ok_or_else(|| TransportError::InvalidAddress(opts.server_addr.clone()))?
        .to_string();

    let scheme = if opts.plaintext { "ws" } else { "wss" };
    let url = format!(
        "{scheme}://{}{}?token={}",
        opts.server_addr, TUNNEL_PATH, opts.token
    );

    debug!("connecting to {scheme}://{}{}", opts.server_addr, TUNNEL_PATH);

    let tcp = TcpStream::connect(&opts.server_addr).await?;

    let io: BoxedIo = if opts.plaintext {
        Box::new(tcp)
    } else {
        let connector = build_tls_connector(opts.insecure);
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| TransportError::Tls(format!("invalid server name {host}: {e}")))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::Tls(format!("tls handshake failed: {e}")))?;
        Box::new(tls)
    };

    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(TUNNEL_SUBPROTOCOL),
    );

    let (ws, response) = tokio_tungstenite::client_async(request, io).await?;

    info!(
        status = %response.status(),
        "tunnel websocket established to {}",
        opts.server_addr
    );
    Ok(ws)
}

fn build_tls_connector(insecure: bool) -> TlsConnector {
    ensure_crypto_provider();

    let config = if insecure {
        warn!("server certificate verification disabled");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    TlsConnector::from(Arc::new(config))
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

/// Certificate verifier that accepts anything. Development only.
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framed::{upgrade_raw, FramedTransport};
    use crate::listener::TunnelListener;
    use crate::Role;
    use burrow_catalog::{Catalog, MemoryCatalog};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn plaintext_end_to_end() {
        let catalog = std::sync::Arc::new(MemoryCatalog::new());
        let tunnel = catalog.create_tunnel("test").unwrap();

        let listener = TunnelListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            None,
            catalog.clone() as std::sync::Arc<dyn Catalog>,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let opts = ConnectOptions {
            server_addr: addr.to_string(),
            token: tunnel.token.clone(),
            plaintext: true,
            insecure: false,
        };
        let client_ws = connect(&opts).await.unwrap();
        let incoming = accept.await.unwrap();

        assert_eq!(incoming.tunnel.id, tunnel.id);

        let (mut server_io, _, _) = FramedTransport::new(incoming.ws);
        let (mut client_io, _, _) = FramedTransport::new(client_ws);

        client_io.write_all(b"first frame").await.unwrap();
        let mut buf = [0u8; 11];
        server_io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first frame");
    }

    #[tokio::test]
    async fn unknown_token_is_refused_with_401() {
        let catalog = std::sync::Arc::new(MemoryCatalog::new());
        catalog.create_tunnel("test").unwrap();

        let listener = TunnelListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            None,
            catalog as std::sync::Arc<dyn Catalog>,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        // Keep the endpoint serving while the bad client is refused.
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let opts = ConnectOptions {
            server_addr: addr.to_string(),
            token: "not-a-real-token".to_string(),
            plaintext: true,
            insecure: false,
        };

        let err = connect(&opts).await.expect_err("handshake must be refused");
        match err {
            TransportError::WebSocket(msg) => {
                assert!(msg.contains("401"), "expected a 401 refusal, got: {msg}");
            }
            other => panic!("expected an http refusal, got: {other}"),
        }
    }

    #[tokio::test]
    async fn upgrade_raw_round_trip() {
        // The in-memory path tests use: no sockets at all.
        let (a, b) = tokio::io::duplex(4096);
        let (server, client) =
            tokio::join!(upgrade_raw(a, Role::Server), upgrade_raw(b, Role::Client));

        let (mut s, _, _) = FramedTransport::new(server);
        let (mut c, _, _) = FramedTransport::new(client);

        s.write_all(b"pong?").await.unwrap();
        let mut buf = [0u8; 5];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong?");
    }
}
