//! HTTP ingress with Host-based routing.
//!
//! The relay is a transparent proxy: it reads just enough of the request to
//! route it (request line + headers), then forwards the original bytes
//! unmodified down the tunnel and copies in both directions until the
//! connection ends. Bodies stream; nothing is reassembled.

use crate::{open_service_stream, IngressError};
use burrow_catalog::Catalog;
use burrow_registry::TunnelRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Largest request head (request line + headers) the router will buffer.
const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// What request-head parsing produced.
#[derive(Debug, PartialEq)]
pub(crate) struct RequestHead {
    pub host: Option<String>,
    pub path: String,
}

/// Plain-HTTP ingress listener.
pub struct HttpIngress {
    listener: TcpListener,
    catalog: Arc<dyn Catalog>,
    registry: Arc<TunnelRegistry>,
}

impl HttpIngress {
    pub async fn bind(
        bind_addr: SocketAddr,
        catalog: Arc<dyn Catalog>,
        registry: Arc<TunnelRegistry>,
    ) -> Result<Self, IngressError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| IngressError::Bind {
                address: bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        info!("http ingress listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            catalog,
            registry,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, IngressError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires.
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
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(socket, peer, catalog, registry).await {
                            debug!(%peer, "http connection ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("http accept failed: {e}");
                    return;
                }
            }
        }
    }
}

/// Handle one client connection. Generic over the socket so the HTTPS
/// ingress can feed decrypted TLS streams through the same path.
pub(crate) async fn serve_connection<S>(
    mut socket: S,
    peer: SocketAddr,
    catalog: Arc<dyn Catalog>,
    registry: Arc<TunnelRegistry>,
) -> Result<(), IngressError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = Vec::with_capacity(4096);
    let head = loop {
        if buf.len() >= MAX_REQUEST_HEAD {
            respond(&mut socket, 400, "Request header too large").await?;
            return Ok(());
        }

        let mut chunk = [0u8; 4096];
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            // Client went away before sending a full request head.
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        match parse_request_head(&buf) {
            Ok(Some(head)) => break head,
            Ok(None) => continue,
            Err(_) => {
                respond(&mut socket, 400, "Malformed request").await?;
                return Ok(());
            }
        }
    };

    let host = match head.host {
        Some(host) => host,
        None => {
            respond(&mut socket, 400, "Missing Host header").await?;
            return Ok(());
        }
    };

    debug!(%peer, %host, path = %head.path, "http request");

    let service = match catalog.lookup_http_service(&host).await? {
        Some(service) => service,
        None => {
            respond(&mut socket, 404, "Service not found").await?;
            return Ok(());
        }
    };

    if service.path_prefix != "/" && !head.path.starts_with(&service.path_prefix) {
        respond(&mut socket, 404, "Path not found").await?;
        return Ok(());
    }

    let link = match registry.lookup(&service.tunnel_id).await {
        Some(link) => link,
        None => {
            warn!(%host, tunnel_id = %service.tunnel_id, "tunnel not connected");
            respond(&mut socket, 503, "Service unavailable").await?;
            return Ok(());
        }
    };

    let mut stream =
        match open_service_stream(&link, service.kind, &service.target_addr, &buf).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%host, "failed to open tunnel stream: {e}");
                respond(&mut socket, 503, "Service unavailable").await?;
                return Ok(());
            }
        };

    debug!(%host, target = %service.target_addr, "proxying http connection");
    let _ = tokio::io::copy_bidirectional(&mut socket, &mut stream).await;
    Ok(())
}

/// Try to parse the request head out of `buf`. `Ok(None)` means the head is
/// not complete yet.
pub(crate) fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, ()> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {
            let host = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .map(strip_port)
                .filter(|h| !h.is_empty());
            let path = req.path.unwrap_or("/").to_string();
            Ok(Some(RequestHead { host, path }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(()),
    }
}

/// `example.com:8080` becomes `example.com`
fn strip_port(host: &str) -> String {
    host.trim().split(':').next().unwrap_or(host).to_string()
}

async fn respond<S>(socket: &mut S, status: u16, body: &str) -> Result<(), IngressError>
where
    S: AsyncWrite + Unpin + Send,
{
    let reason = match status {
        400 => "Bad Request",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}\n",
        body.len() + 1
    );
    socket.write_all(response.as_bytes()).await?;
    Ok(())
}
