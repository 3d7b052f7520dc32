//! Wire formats shared by the burrow relay and agent.
//!
//! Three independent formats live here:
//!
//! - [`ControlMessage`]: the JSON keepalive messages exchanged as WebSocket
//!   text frames (`{"type":"ping"}` / `{"type":"pong"}`).
//! - [`Frame`]: the binary multiplexer frame carried inside WebSocket binary
//!   frames, routing bytes to individual tunnel streams.
//! - [`StreamHeader`]: the one-shot prefix written at the start of every
//!   newly opened stream, telling the agent what to dial.

pub mod control;
pub mod frame;
pub mod header;

pub use control::{ControlError, ControlMessage};
pub use frame::{Frame, FrameError, FrameKind, StreamId};
pub use header::{HeaderError, ServiceKind, StreamHeader};

/// Keepalive cadence both ends default to. A link silent for three
/// intervals is considered dead by whoever is watching it.
pub const DEFAULT_PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
