//! Control-plane message codec.
//!
//! Control messages travel as WebSocket text frames, one JSON object per
//! frame. The set of message types is closed; decoding reports an unknown
//! tag as its own error variant so callers can log and ignore it without
//! tearing the connection down.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Control message codec errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown control message type: {0}")]
    UnknownType(String),
}

/// A control-plane message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Ping,
    Pong,
}

/// On-the-wire shape; the tag is validated by hand in [`ControlMessage::decode`].
#[derive(Serialize, Deserialize)]
struct RawControl {
    #[serde(rename = "type")]
    kind: String,
}

impl ControlMessage {
    /// Encode to the JSON text carried in a single text frame.
    pub fn encode(&self) -> String {
        let kind = match self {
            ControlMessage::Ping => "ping",
            ControlMessage::Pong => "pong",
        };
        // A two-field-free struct with a known tag cannot fail to serialize.
        serde_json::to_string(&RawControl { kind: kind.to_string() })
            .unwrap_or_else(|_| format!("{{\"type\":\"{kind}\"}}"))
    }

    /// Decode the JSON text of one text frame.
    pub fn decode(text: &str) -> Result<Self, ControlError> {
        let raw: RawControl = serde_json::from_str(text)?;
        match raw.kind.as_str() {
            "ping" => Ok(ControlMessage::Ping),
            "pong" => Ok(ControlMessage::Pong),
            other => Err(ControlError::UnknownType(other.to_string())),
        }
    }
}
