//! HTTPS ingress with SNI-based routing.
//!
//! The listener peeks the TLS ClientHello to learn the hostname, resolves
//! the service, then follows its TLS mode: `terminate` decrypts with a
//! certificate from the [`CertProvider`] and reuses the HTTP routing path
//! on the plaintext; `passthrough` forwards the raw TLS bytes (ClientHello
//! included) down the tunnel untouched.

use crate::cert::CertProvider;
use crate::http::serve_connection;
use crate::prefixed::PrefixedIo;
use crate::sni::extract_sni;
use crate::{open_service_stream, IngressError};
use burrow_catalog::{Catalog, TlsMode};
use burrow_proto::ServiceKind;
use burrow_registry::TunnelRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Upper bound on a sane ClientHello record.
const MAX_CLIENT_HELLO: usize = 16 * 1024 + 5;

/// TLS ingress listener.
pub struct HttpsIngress {
    listener: TcpListener,
    catalog: Arc<dyn Catalog>,
    registry: Arc<TunnelRegistry>,
    certs: Arc<dyn CertProvider>,
}

impl HttpsIngress {
    pub async fn bind(
        bind_addr: SocketAddr,
        catalog: Arc<dyn Catalog>,
        registry: Arc<TunnelRegistry>,
        certs: Arc<dyn CertProvider>,
    ) -> Result<Self, IngressError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| IngressError::Bind {
                address: bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        info!("https ingress listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            catalog,
            registry,
            certs,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, IngressError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => {
                    let catalog = self.catalog.clone();
                    let registry = self.registry.clone();
                    let certs = self.certs.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            serve_tls_connection(socket, peer, catalog, registry, certs).await
                        {
                            debug!(%peer, "https connection ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("https accept failed: {e}");
                    return;
                }
            }
        }
    }
}

async fn serve_tls_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    catalog: Arc<dyn Catalog>,
    registry: Arc<TunnelRegistry>,
    certs: Arc<dyn CertProvider>,
) -> Result<(), IngressError> {
    let hello = read_client_hello(&mut socket).await?;

    let hostname = match extract_sni(&hello) {
        Ok(hostname) => hostname,
        Err(e) => {
            debug!(%peer, "dropping tls connection without usable sni: {e}");
            return Ok(());
        }
    };

    debug!(%peer, %hostname, "tls connection");

    let service = match catalog.lookup_http_service(&hostname).await? {
        Some(service) => service,
        None => {
            // No application layer to answer on; just drop.
            debug!(%hostname, "no https service, dropping connection");
            return Ok(());
        }
    };

    match service.tls_mode {
        TlsMode::Passthrough => {
            let link = registry
                .lookup(&service.tunnel_id)
                .await
                .ok_or(IngressError::TunnelNotConnected)?;

            let mut stream =
                open_service_stream(&link, ServiceKind::Tcp, &service.target_addr, &hello).await?;

            debug!(%hostname, target = %service.target_addr, "tls passthrough");
            let _ = tokio::io::copy_bidirectional(&mut socket, &mut stream).await;
            Ok(())
        }
        TlsMode::Terminate => {
            let config = certs.server_config(&hostname).await?;
            let acceptor = TlsAcceptor::from(config);

            let replayed = PrefixedIo::new(hello, socket);
            let tls_stream = acceptor
                .accept(replayed)
                .await
                .map_err(|e| IngressError::Tls(e.to_string()))?;

            debug!(%hostname, "tls terminated, handing to http routing");
            serve_connection(tls_stream, peer, catalog, registry).await
        }
    }
}

/// Read exactly one TLS record (the ClientHello) off the socket.
async fn read_client_hello(socket: &mut TcpStream) -> Result<Vec<u8>, IngressError> {
    let mut header = [0u8; 5];
    socket.read_exact(&mut header).await?;

    // 0x16 = handshake record
    if header[0] != 0x16 {
        return Err(IngressError::Tls("not a tls handshake".to_string()));
    }

    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if 5 + record_len > MAX_CLIENT_HELLO {
        return Err(IngressError::Tls("client hello too large".to_string()));
    }

    let mut record = vec![0u8; record_len];
    socket.read_exact(&mut record).await?;

    let mut hello = Vec::with_capacity(5 + record_len);
    hello.extend_from_slice(&header);
    hello.extend_from_slice(&record);
    Ok(hello)
}
