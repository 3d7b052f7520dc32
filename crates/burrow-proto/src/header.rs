//! Stream header: the one-shot prefix on every newly opened stream.
//!
//! Layout on the wire:
//!
//! - 2 bytes: big-endian length `L` of the JSON body, `1 ..= 65535`
//! - `L` bytes: UTF-8 JSON `{"type":"http"|"tcp","target":"host:port"}`
//! - 1 byte: ASCII newline
//!
//! Everything after the newline is opaque payload forwarded verbatim. Any
//! violation (zero length, missing newline, unparseable JSON, unknown type)
//! closes the stream without a response.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum JSON body length the two-byte prefix can express.
pub const MAX_HEADER_LEN: usize = 0xFFFF;

/// Stream header errors
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("header body length {0} out of range")]
    InvalidLength(usize),

    #[error("header not terminated with newline")]
    MissingNewline,

    #[error("malformed header body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("i/o error reading header: {0}")]
    Io(#[from] std::io::Error),
}

/// What kind of service a stream targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Http,
    Tcp,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKind::Http => write!(f, "http"),
            ServiceKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// Metadata for a newly opened stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    /// Address the agent dials locally, in `host:port` form.
    pub target: String,
}

impl StreamHeader {
    pub fn new(kind: ServiceKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }

    /// Encode to the length-prefixed, newline-terminated wire form.
    pub fn encode(&self) -> Result<Bytes, HeaderError> {
        let body = serde_json::to_vec(self)?;
        if body.is_empty() || body.len() > MAX_HEADER_LEN {
            return Err(HeaderError::InvalidLength(body.len()));
        }

        let mut buf = BytesMut::with_capacity(2 + body.len() + 1);
        buf.put_u16(body.len() as u16);
        buf.extend_from_slice(&body);
        buf.put_u8(b'\n');
        Ok(buf.freeze())
    }

    /// Decode from a complete in-memory buffer.
    ///
    /// `buf` must contain exactly the `2 + L + 1` header bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < 3 {
            return Err(HeaderError::InvalidLength(buf.len()));
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if len == 0 || buf.len() != 2 + len + 1 {
            return Err(HeaderError::InvalidLength(len));
        }
        if buf[2 + len] != b'\n' {
            return Err(HeaderError::MissingNewline);
        }
        Ok(serde_json::from_slice(&buf[2..2 + len])?)
    }

    /// Read and decode exactly one header from the start of a stream.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, HeaderError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 2];
        reader.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(HeaderError::InvalidLength(0));
        }

        let mut body = vec![0u8; len + 1];
        reader.read_exact(&mut body).await?;
        if body[len] != b'\n' {
            return Err(HeaderError::MissingNewline);
        }

        Ok(serde_json::from_slice(&body[..len])?)
    }
}
