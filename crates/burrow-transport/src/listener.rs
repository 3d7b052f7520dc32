//! Relay-side tunnel endpoint listener.
//!
//! Accepts TCP connections, optionally terminates TLS, and authenticates
//! the upgrade request *before* completing the WebSocket handshake: the
//! request head is read and parsed here, the bearer token (`?token=` query
//! parameter or `Authorization: Bearer`) is resolved against the catalog,
//! and a missing or invalid token is refused with a plain HTTP 401 so no
//! unauthenticated peer ever sees a completed upgrade. Only then are the
//! buffered head bytes replayed into the WebSocket handshake.

use crate::framed::{BoxedIo, WsStream};
use crate::{TransportError, HANDSHAKE_TIMEOUT, TUNNEL_PATH, TUNNEL_SUBPROTOCOL};
use burrow_catalog::{Catalog, Tunnel};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

/// Largest upgrade request head the endpoint will buffer.
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// An accepted, authenticated, upgraded tunnel connection.
pub struct IncomingTunnel {
    pub ws: WsStream,
    /// The tunnel the presented token resolved to.
    pub tunnel: Tunnel,
    pub peer: SocketAddr,
}

/// Listener for the agent-facing tunnel endpoint.
pub struct TunnelListener {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
    catalog: Arc<dyn Catalog>,
}

impl TunnelListener {
    /// Bind the endpoint. With a TLS acceptor the endpoint speaks `wss`,
    /// otherwise plain `ws`. Tokens are validated against `catalog`.
    pub async fn bind(
        bind_addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        catalog: Arc<dyn Catalog>,
    ) -> Result<Self, TransportError> {
        let tcp = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TransportError::Bind {
                address: bind_addr.ip().to_string(),
                port: bind_addr.port(),
                reason: e.to_string(),
            })?;

        let local = tcp.local_addr()?;
        info!(
            "tunnel endpoint listening on {}://{}{}",
            if tls.is_some() { "wss" } else { "ws" },
            local,
            TUNNEL_PATH
        );

        Ok(Self { tcp, tls, catalog })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.tcp.local_addr()?)
    }

    /// Accept the next authenticated tunnel connection.
    ///
    /// Connections that fail TLS, present the wrong path, present a missing
    /// or invalid token, or stall past the handshake timeout are refused,
    /// logged and skipped; the loop keeps serving.
    pub async fn accept(&self) -> Result<IncomingTunnel, TransportError> {
        loop {
            let (stream, peer) = self.tcp.accept().await?;
            debug!(%peer, "incoming tunnel connection");

            match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(stream, peer)).await {
                Ok(Ok(incoming)) => return Ok(incoming),
                Ok(Err(e)) => {
                    // Token text never appears in the error.
                    warn!(%peer, "tunnel handshake refused: {e}");
                    continue;
                }
                Err(_) => {
                    warn!(%peer, "tunnel handshake timed out");
                    continue;
                }
            }
        }
    }

    async fn handshake(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<IncomingTunnel, TransportError> {
        let mut io: BoxedIo = match &self.tls {
            Some(acceptor) => {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                Box::new(tls_stream)
            }
            None => Box::new(stream),
        };

        // Read the upgrade request head ourselves so the token can be
        // checked before any 101 goes out.
        let (parsed, head) = read_upgrade_head(&mut io).await?;

        if parsed.path != TUNNEL_PATH {
            refuse(&mut io, 404, "Not Found").await;
            return Err(TransportError::InvalidUpgrade(format!(
                "unexpected path {}",
                parsed.path
            )));
        }

        let token = match parsed.token {
            Some(token) => token,
            None => {
                refuse(&mut io, 401, "Unauthorized").await;
                return Err(TransportError::Unauthorized);
            }
        };

        let tunnel = match self.catalog.lookup_by_token(&token).await {
            Ok(Some(tunnel)) => tunnel,
            Ok(None) => {
                refuse(&mut io, 401, "Unauthorized").await;
                return Err(TransportError::Unauthorized);
            }
            Err(e) => {
                refuse(&mut io, 500, "Internal Server Error").await;
                return Err(TransportError::TokenLookup(e.to_string()));
            }
        };

        // Hand the buffered head back to the WebSocket handshake.
        let replayed: BoxedIo = Box::new(Replayed::new(head, io));

        let wants_subprotocol = parsed.wants_subprotocol;
        let callback = move |_req: &Request, mut resp: Response| {
            if wants_subprotocol {
                resp.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static(TUNNEL_SUBPROTOCOL),
                );
            }
            Ok(resp)
        };

        let ws = tokio_tungstenite::accept_hdr_async(replayed, callback).await?;

        debug!(%peer, tunnel_id = %tunnel.id, "tunnel websocket established");
        Ok(IncomingTunnel { ws, tunnel, peer })
    }
}

/// What the endpoint needs out of the upgrade request.
#[derive(Debug, PartialEq)]
struct UpgradeHead {
    path: String,
    token: Option<String>,
    wants_subprotocol: bool,
}

/// Read bytes until the request head is complete, then parse it. Returns
/// the parsed head plus the raw bytes consumed, for replay.
async fn read_upgrade_head(io: &mut BoxedIo) -> Result<(UpgradeHead, Vec<u8>), TransportError> {
    let mut buf = Vec::with_capacity(1024);

    loop {
        if buf.len() >= MAX_UPGRADE_HEAD {
            return Err(TransportError::InvalidUpgrade(
                "request head too large".to_string(),
            ));
        }

        let mut chunk = [0u8; 1024];
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::InvalidUpgrade(
                "connection closed during handshake".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        match parse_upgrade_head(&buf)? {
            Some(parsed) => return Ok((parsed, buf)),
            None => continue,
        }
    }
}

/// Parse the request head out of `buf`. `Ok(None)` means the head is not
/// complete yet.
fn parse_upgrade_head(buf: &[u8]) -> Result<Option<UpgradeHead>, TransportError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            return Err(TransportError::InvalidUpgrade(format!(
                "malformed upgrade request: {e}"
            )))
        }
    }

    let full_path = req.path.unwrap_or("/");
    let (path, query) = match full_path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (full_path, None),
    };

    let token = extract_token(query, req.headers);

    let wants_subprotocol = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("Sec-WebSocket-Protocol"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(|v| v.split(',').any(|p| p.trim() == TUNNEL_SUBPROTOCOL))
        .unwrap_or(false);

    Ok(Some(UpgradeHead {
        path: path.to_string(),
        token,
        wants_subprotocol,
    }))
}

/// Token from `?token=` or `Authorization: Bearer …`, in that order.
fn extract_token(query: Option<&str>, headers: &[httparse::Header<'_>]) -> Option<String> {
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "token" && !value.is_empty() {
                return Some(value.into_owned());
            }
        }
    }

    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("Authorization"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
}

/// Best-effort plain HTTP refusal; the connection closes right after.
async fn refuse(io: &mut BoxedIo, status: u16, reason: &str) {
    let response =
        format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    let _ = io.write_all(response.as_bytes()).await;
    let _ = io.shutdown().await;
}

/// Replays the already-consumed head bytes before the live socket, so the
/// WebSocket handshake sees the request it expects.
#[derive(Debug)]
struct Replayed {
    prefix: Vec<u8>,
    consumed: usize,
    inner: BoxedIo,
}

impl Replayed {
    fn new(prefix: Vec<u8>, inner: BoxedIo) -> Self {
        Self {
            prefix,
            consumed: 0,
            inner,
        }
    }
}

impl AsyncRead for Replayed {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.consumed < this.prefix.len() {
            let remaining = &this.prefix[this.consumed..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.consumed += n;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Replayed {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
