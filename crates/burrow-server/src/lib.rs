//! Relay server wiring.
//!
//! Glues the pieces together: catalog, tunnel registry, tunnel endpoint
//! (agent-facing WebSocket listener), and the three ingress surfaces.
//! Owns the root cancellation scope and the bounded-shutdown deadline.

pub mod config;
pub mod server;

pub use config::{AcmeConfig, OidcConfig, ServerConfig};
pub use server::Server;

use thiserror::Error;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("catalog error: {0}")]
    Catalog(#[from] burrow_catalog::CatalogError),

    #[error("transport error: {0}")]
    Transport(#[from] burrow_transport::TransportError),

    #[error("ingress error: {0}")]
    Ingress(#[from] burrow_ingress::IngressError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
