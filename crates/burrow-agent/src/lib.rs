//! The burrow agent.
//!
//! Runs next to the private services: dials the relay once, keeps the link
//! alive with pings, accepts streams the relay opens, and forwards each to
//! the local target named in its stream header. If the link drops or goes
//! stale the agent reconnects with exponential backoff.

pub mod agent;
pub mod forwarder;
pub mod reconnect;

pub use agent::{Agent, AgentConfig};
pub use forwarder::{StreamHandler, TcpForwarder};
pub use reconnect::{Backoff, BackoffConfig};

use thiserror::Error;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(#[from] burrow_transport::TransportError),

    #[error("link error: {0}")]
    Link(#[from] burrow_link::LinkError),

    #[error("connection lost")]
    ConnectionLost,

    #[error("link stale: no ping or pong for too long")]
    Stale,

    #[error("failed to connect to target {address}: {source}")]
    TargetDial {
        address: String,
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,
}
