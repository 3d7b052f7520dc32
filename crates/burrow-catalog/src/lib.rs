//! Tunnel metadata storage.
//!
//! The proxy core consumes storage through the narrow [`Catalog`] trait.
//! Everything else (the SQLite implementation, CRUD for the management
//! surface, uptime statistics) lives behind it. Two implementations ship: [`MemoryCatalog`] (tests, embedding) and
//! [`SqlCatalog`] (sea-orm on SQLite).

pub mod entities;
pub mod memory;
pub mod migrator;
pub mod model;
pub mod sql;

pub use memory::MemoryCatalog;
pub use model::{
    Check, CheckStatus, NewCheck, NewService, Service, TlsMode, Tunnel, UptimeStats,
};
pub use sql::SqlCatalog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Catalog errors
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("duplicate {field}: {value}")]
    Duplicate { field: &'static str, value: String },

    #[error("invalid service definition: {0}")]
    InvalidService(String),
}

/// The capability interface the proxy core depends on.
///
/// Kept deliberately narrow: the registry writes the check ledger, the
/// ingress resolves services, the tunnel endpoint authenticates tokens.
/// Management CRUD is not part of this trait.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Resolve a bearer token to its tunnel. Comparison is constant-time;
    /// at most one tunnel matches (tokens are unique).
    async fn lookup_by_token(&self, token: &str) -> Result<Option<Tunnel>, CatalogError>;

    /// Resolve an HTTP ingress domain to its enabled service.
    async fn lookup_http_service(&self, domain: &str) -> Result<Option<Service>, CatalogError>;

    /// All enabled TCP services with a listen address.
    async fn list_tcp_services(&self) -> Result<Vec<Service>, CatalogError>;

    /// Append one row to the check ledger.
    async fn append_check(&self, check: NewCheck) -> Result<(), CatalogError>;

    /// Delete check rows older than `cutoff`; returns how many went.
    async fn trim_checks_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CatalogError>;
}

/// Mint a fresh tunnel token: 256 bits of entropy, hex-encoded.
pub fn generate_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time token equality.
pub(crate) fn token_matches(candidate: &str, stored: &str) -> bool {
    use subtle::ConstantTimeEq;
    candidate.as_bytes().ct_eq(stored.as_bytes()).into()
}
