//! The multiplexed tunnel link.
//!
//! One [`Link`] owns one framed transport and layers two planes over it: a
//! control plane (JSON keepalives, delegated to the transport's text
//! frames) and a stream plane (many independent byte streams, framed by
//! [`burrow_proto::Frame`]). Streams opened here are ordinary
//! `AsyncRead + AsyncWrite` values, so proxy code can treat them exactly
//! like sockets.

pub mod link;
pub mod stream;

pub use link::{Link, LinkError, LinkRole};
pub use stream::TunnelStream;
