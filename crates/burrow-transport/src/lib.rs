//! WebSocket tunnel transport.
//!
//! One persistent WebSocket connects each agent to the relay. This crate
//! adapts that connection for the layers above:
//!
//! - [`FramedTransport`] turns the binary-frame plane into an ordered byte
//!   pipe (`AsyncRead`/`AsyncWrite`, one outbound frame per write) for the
//!   stream multiplexer, and splits the text-frame plane off into a
//!   [`ControlSender`]/[`ControlReceiver`] pair.
//! - [`TunnelListener`] accepts relay-side connections: TCP, optional TLS,
//!   WebSocket upgrade with bearer-token extraction.
//! - [`connect`] dials from the agent side.

pub mod connector;
pub mod framed;
pub mod listener;

pub use connector::{connect, ConnectOptions};
pub use framed::{upgrade_raw, BoxedIo, ControlReceiver, ControlSender, FramedTransport, Io, WsStream};
pub use listener::{IncomingTunnel, TunnelListener};

pub use tokio_tungstenite::tungstenite::protocol::Role;

use std::time::Duration;
use thiserror::Error;

/// Path of the tunnel endpoint on the relay.
pub const TUNNEL_PATH: &str = "/tunnel";

/// WebSocket subprotocol both ends request and accept.
pub const TUNNEL_SUBPROTOCOL: &str = "tunnel";

/// Time allowed for the TCP/TLS/WebSocket handshake to complete.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-write deadline on the control plane.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind {address}:{port}: {reason}")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("invalid upgrade request: {0}")]
    InvalidUpgrade(String),

    #[error("invalid tunnel token")]
    Unauthorized,

    #[error("token lookup failed: {0}")]
    TokenLookup(String),

    #[error("write timed out")]
    WriteTimeout,

    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    #[error("transport closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}
