//! Agent lifecycle: connect, keep alive, accept streams, reconnect.

use crate::forwarder::{StreamHandler, TcpForwarder};
use crate::reconnect::{Backoff, BackoffConfig};
use crate::AgentError;
use burrow_link::{Link, LinkRole, TunnelStream};
use burrow_proto::{ControlMessage, ServiceKind, StreamHeader};
use burrow_transport::{connect, ConnectOptions, FramedTransport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay address in `host:port` form.
    pub server_addr: String,
    /// Tunnel bearer token.
    pub token: String,
    /// Dial `ws://` instead of `wss://`.
    pub plaintext: bool,
    /// Skip relay certificate verification.
    pub insecure: bool,
    /// Keepalive cadence; the link counts as stale after three silent
    /// intervals.
    pub ping_interval: Duration,
    pub backoff: BackoffConfig,
}

impl AgentConfig {
    pub fn new(server_addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            token: token.into(),
            plaintext: false,
            insecure: false,
            ping_interval: burrow_proto::DEFAULT_PING_INTERVAL,
            backoff: BackoffConfig::default(),
        }
    }
}

type Handlers = Arc<HashMap<ServiceKind, Arc<dyn StreamHandler>>>;

/// The tunnel agent. One agent maintains one link.
pub struct Agent {
    config: AgentConfig,
    handlers: Handlers,
    shutdown: CancellationToken,
}

impl Agent {
    /// An agent with the default forwarder handling both stream types.
    pub fn new(config: AgentConfig) -> Self {
        let forwarder: Arc<dyn StreamHandler> = Arc::new(TcpForwarder::new());
        let mut handlers: HashMap<ServiceKind, Arc<dyn StreamHandler>> = HashMap::new();
        handlers.insert(ServiceKind::Http, forwarder.clone());
        handlers.insert(ServiceKind::Tcp, forwarder);

        Self {
            config,
            handlers: Arc::new(handlers),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the handler for one stream type.
    pub fn with_handler(mut self, kind: ServiceKind, handler: Arc<dyn StreamHandler>) -> Self {
        let mut handlers: HashMap<ServiceKind, Arc<dyn StreamHandler>> =
            self.handlers.as_ref().clone();
        handlers.insert(kind, handler);
        self.handlers = Arc::new(handlers);
        self
    }

    /// Token that stops the agent when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shut down. Reconnects with exponential backoff; returns an
    /// error only when the attempt budget is exhausted.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.connect_link().await {
                Ok(link) => {
                    backoff.reset();
                    match self.drive(link).await {
                        // Clean shutdown.
                        Ok(()) => return Ok(()),
                        Err(e) => warn!("tunnel connection lost: {e}"),
                    }
                }
                Err(e) => warn!("tunnel connection failed: {e}"),
            }

            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let delay = match backoff.next_delay() {
                Some(delay) => delay,
                None => return Err(AgentError::ReconnectExhausted),
            };
            info!(
                "reconnecting in {:.0?} (attempt {})",
                delay,
                backoff.attempt()
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_link(&self) -> Result<Arc<Link>, AgentError> {
        let opts = ConnectOptions {
            server_addr: self.config.server_addr.clone(),
            token: self.config.token.clone(),
            plaintext: self.config.plaintext,
            insecure: self.config.insecure,
        };

        let ws = connect(&opts).await?;
        let (transport, ctrl_tx, ctrl_rx) = FramedTransport::new(ws);
        let link = Arc::new(Link::new(transport, ctrl_tx, ctrl_rx, LinkRole::Agent));

        info!("tunnel established to {}", self.config.server_addr);
        Ok(link)
    }

    /// Service one established link until it dies or the agent stops.
    async fn drive(&self, link: Arc<Link>) -> Result<(), AgentError> {
        let accept_task = {
            let link = link.clone();
            let handlers = self.handlers.clone();
            tokio::spawn(async move {
                while let Ok(stream) = link.accept_stream().await {
                    let handlers = handlers.clone();
                    tokio::spawn(handle_incoming(stream, handlers));
                }
            })
        };

        let result = self.control_loop(&link).await;
        link.close();
        let _ = accept_task.await;
        result
    }

    async fn control_loop(&self, link: &Arc<Link>) -> Result<(), AgentError> {
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = link.closed() => return Err(AgentError::ConnectionLost),
                msg = link.recv_control() => match msg {
                    None => return Err(AgentError::ConnectionLost),
                    Some(Ok(ControlMessage::Ping)) => {
                        if link.pong().await.is_err() {
                            return Err(AgentError::ConnectionLost);
                        }
                    }
                    // Activity clock already refreshed by recv_control.
                    Some(Ok(ControlMessage::Pong)) => {}
                    Some(Err(e)) => warn!("ignoring control message: {e}"),
                },
                _ = keepalive.tick() => {
                    if link.last_activity().elapsed() > self.config.ping_interval * 3 {
                        warn!("link went silent, forcing reconnect");
                        return Err(AgentError::Stale);
                    }
                    if link.ping().await.is_err() {
                        return Err(AgentError::ConnectionLost);
                    }
                }
            }
        }
    }
}

/// Read the header off a fresh stream and dispatch it. Any header problem
/// closes the stream without a response.
async fn handle_incoming(mut stream: TunnelStream, handlers: Handlers) {
    let header = match StreamHeader::read_from(&mut stream).await {
        Ok(header) => header,
        Err(e) => {
            debug!("rejecting stream with bad header: {e}");
            return;
        }
    };

    let handler = match handlers.get(&header.kind) {
        Some(handler) => handler.clone(),
        None => {
            debug!(kind = %header.kind, "no handler for stream type");
            return;
        }
    };

    if let Err(e) = handler.handle_stream(stream, header).await {
        debug!("stream handler failed: {e}");
    }
}
