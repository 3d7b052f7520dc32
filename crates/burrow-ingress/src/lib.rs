//! Public-facing ingress.
//!
//! Three surfaces feed the same forwarding primitive (open a stream on the
//! owning tunnel's link, write the stream header, copy bytes until either
//! side closes):
//!
//! - [`HttpIngress`]: plain HTTP, routed by `Host` header.
//! - [`HttpsIngress`]: TLS, routed by SNI; terminates or passes through
//!   depending on the service's TLS mode.
//! - [`TcpIngress`]: raw TCP, one relay-side listener per service.

pub mod cert;
pub mod http;
pub mod https;
pub mod prefixed;
pub mod sni;
pub mod tcp;

pub use cert::{CertProvider, StaticCertProvider};
pub use http::HttpIngress;
pub use https::HttpsIngress;
pub use tcp::TcpIngress;

use burrow_link::{Link, TunnelStream};
use burrow_proto::{ServiceKind, StreamHeader};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Ingress errors
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("listener already bound for {0}")]
    AlreadyBound(String),

    #[error("not an enabled tcp service: {0}")]
    NotTcpService(String),

    #[error("tunnel not connected")]
    TunnelNotConnected,

    #[error("failed to open tunnel stream: {0}")]
    StreamOpen(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("catalog error: {0}")]
    Catalog(#[from] burrow_catalog::CatalogError),
}

/// Open a stream on `link`, write the header for `kind`/`target`, then any
/// already-buffered client bytes. The returned stream is ready for the
/// bidirectional copy.
pub(crate) async fn open_service_stream(
    link: &Arc<Link>,
    kind: ServiceKind,
    target: &str,
    initial: &[u8],
) -> Result<TunnelStream, IngressError> {
    let mut stream = link
        .open_stream()
        .await
        .map_err(|e| IngressError::StreamOpen(e.to_string()))?;

    let header = StreamHeader::new(kind, target)
        .encode()
        .map_err(|e| IngressError::StreamOpen(e.to_string()))?;
    stream.write_all(&header).await?;

    if !initial.is_empty() {
        stream.write_all(initial).await?;
    }

    Ok(stream)
}
