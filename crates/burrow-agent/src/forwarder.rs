//! Stream handlers: what the agent does with a stream the relay opened.

use crate::AgentError;
use async_trait::async_trait;
use burrow_link::TunnelStream;
use burrow_proto::StreamHeader;
use std::time::Duration;
use tokio::net::TcpStream;

/// Handles one accepted stream of a given type. The stream is positioned
/// just past its header; everything on it is raw payload.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle_stream(
        &self,
        stream: TunnelStream,
        header: StreamHeader,
    ) -> Result<(), AgentError>;
}

/// Dials the header's target over loopback/LAN and copies bytes both ways.
/// HTTP and TCP streams are identical from the agent's point of view.
pub struct TcpForwarder {
    dial_timeout: Duration,
}

impl TcpForwarder {
    pub fn new() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for TcpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamHandler for TcpForwarder {
    async fn handle_stream(
        &self,
        mut stream: TunnelStream,
        header: StreamHeader,
    ) -> Result<(), AgentError> {
        tracing::debug!(kind = %header.kind, target = %header.target, "forwarding stream");

        let connect = TcpStream::connect(&header.target);
        let mut target = match tokio::time::timeout(self.dial_timeout, connect).await {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => {
                return Err(AgentError::TargetDial {
                    address: header.target,
                    source: e,
                })
            }
            Err(_) => {
                return Err(AgentError::TargetDial {
                    address: header.target,
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
                })
            }
        };

        let result = tokio::io::copy_bidirectional(&mut stream, &mut target).await;

        match result {
            Ok((from_client, from_target)) => {
                tracing::debug!(
                    target = header.target,
                    bytes_in = from_client,
                    bytes_out = from_target,
                    "stream completed"
                );
                Ok(())
            }
            Err(e) => Err(AgentError::Io(e)),
        }
    }
}
