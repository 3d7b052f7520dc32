//! Multiplexer frame codec.
//!
//! The stream plane treats the framed transport as an ordered byte pipe and
//! carves it into self-delimiting frames:
//!
//! ```text
//! +----------------+--------+-----------------+----------------+
//! | stream id (u32)| kind u8| payload len u32 | payload        |
//! +----------------+--------+-----------------+----------------+
//! ```
//!
//! All integers are big-endian. `Data` carries stream bytes; the first
//! `Data` frame seen for an unknown stream id opens that stream. `Fin`
//! half-closes the sender's direction and carries no payload.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Identifier of one multiplexed stream within a link.
///
/// The relay allocates even ids, the agent odd ids, so the two sides can
/// open streams without coordination.
pub type StreamId = u32;

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),
}

/// What a frame does to its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Fin,
}

impl FrameKind {
    fn to_byte(self) -> u8 {
        match self {
            FrameKind::Data => 0,
            FrameKind::Fin => 1,
        }
    }

    fn from_byte(b: u8) -> Result<Self, FrameError> {
        match b {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Fin),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// One multiplexer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    /// Fixed header size: stream id + kind + payload length.
    pub const HEADER_LEN: usize = 9;

    /// Upper bound on a single frame's payload.
    pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data,
            payload,
        }
    }

    pub fn fin(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Fin,
            payload: Bytes::new(),
        }
    }

    /// Encode into a single buffer ready for the transport.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.payload.len() > Self::MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.kind.to_byte());
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`, consuming its bytes.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; the caller keeps accumulating and retries.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < Self::HEADER_LEN {
            return Ok(None);
        }

        let stream_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let kind = FrameKind::from_byte(buf[4])?;
        let len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;

        if len > Self::MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(len));
        }
        if buf.len() < Self::HEADER_LEN + len {
            return Ok(None);
        }

        let _ = buf.split_to(Self::HEADER_LEN);
        let payload = buf.split_to(len).freeze();

        Ok(Some(Frame {
            stream_id,
            kind,
            payload,
        }))
    }
}
