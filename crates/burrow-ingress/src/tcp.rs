//! TCP ingress: one relay-side listener per enabled TCP service.

use crate::{open_service_stream, IngressError};
use burrow_catalog::{Catalog, Service};
use burrow_proto::ServiceKind;
use burrow_registry::TunnelRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct ListenerEntry {
    service_id: String,
    task: JoinHandle<()>,
}

/// Dynamic map of TCP listeners, mutated by catalog changes and shutdown.
///
/// Removing a service closes its listener; connections already being
/// proxied keep running until their own end of stream.
pub struct TcpIngress {
    registry: Arc<TunnelRegistry>,
    listeners: Mutex<HashMap<String, ListenerEntry>>,
    shutdown: CancellationToken,
}

impl TcpIngress {
    pub fn new(registry: Arc<TunnelRegistry>, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            listeners: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Start listeners for every enabled TCP service in the catalog.
    /// Individual bind failures are logged and skipped so one broken
    /// service cannot block the rest.
    pub async fn start_all(&self, catalog: &Arc<dyn Catalog>) -> Result<(), IngressError> {
        for service in catalog.list_tcp_services().await? {
            if let Err(e) = self.add_service(&service).await {
                error!(service_id = %service.id, "failed to start tcp listener: {e}");
            }
        }
        Ok(())
    }

    /// Bind a listener for one service. Bind failures bubble to the caller.
    /// Returns the actual bound address (useful when the service asked for
    /// port 0).
    pub async fn add_service(&self, service: &Service) -> Result<std::net::SocketAddr, IngressError> {
        if service.kind != ServiceKind::Tcp || !service.enabled {
            return Err(IngressError::NotTcpService(service.id.clone()));
        }
        let listen_addr = service
            .listen_addr
            .clone()
            .ok_or_else(|| IngressError::NotTcpService(service.id.clone()))?;

        {
            let listeners = self.listeners.lock().unwrap();
            if listeners.contains_key(&listen_addr) {
                return Err(IngressError::AlreadyBound(listen_addr));
            }
        }

        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| IngressError::Bind {
                address: listen_addr.clone(),
                reason: e.to_string(),
            })?;

        let bound_addr = listener.local_addr()?;
        info!(
            %listen_addr,
            service_id = %service.id,
            target = %service.target_addr,
            "tcp listener started"
        );

        let task = tokio::spawn(accept_loop(
            listener,
            service.clone(),
            self.registry.clone(),
            self.shutdown.clone(),
        ));

        let mut listeners = self.listeners.lock().unwrap();
        listeners.insert(
            listen_addr,
            ListenerEntry {
                service_id: service.id.clone(),
                task,
            },
        );
        Ok(bound_addr)
    }

    /// Close the listener bound to `listen_addr`, if any.
    pub fn remove_service(&self, listen_addr: &str) {
        let entry = self.listeners.lock().unwrap().remove(listen_addr);
        if let Some(entry) = entry {
            info!(%listen_addr, service_id = %entry.service_id, "tcp listener stopped");
            entry.task.abort();
        }
    }

    /// Rebind a changed service: close the old listener, start the new one.
    pub async fn update_service(
        &self,
        old_listen_addr: &str,
        service: &Service,
    ) -> Result<std::net::SocketAddr, IngressError> {
        self.remove_service(old_listen_addr);
        self.add_service(service).await
    }

    pub fn bound_addrs(&self) -> Vec<String> {
        self.listeners.lock().unwrap().keys().cloned().collect()
    }

    /// Close every listener.
    pub fn shutdown_all(&self) {
        let mut listeners = self.listeners.lock().unwrap();
        for (listen_addr, entry) in listeners.drain() {
            debug!(%listen_addr, "tcp listener stopped");
            entry.task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    service: Service,
    registry: Arc<TunnelRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                // Non-recoverable accept error: exit and rely on the
                // management surface to re-add the service.
                error!(service_id = %service.id, "tcp accept failed: {e}");
                return;
            }
        };

        debug!(%peer, service_id = %service.id, "tcp connection accepted");

        let service = service.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            forward_connection(socket, &service, &registry).await;
        });
    }
}

/// TCP has no application layer to carry an error; failures just close the
/// client connection.
async fn forward_connection(
    mut socket: tokio::net::TcpStream,
    service: &Service,
    registry: &Arc<TunnelRegistry>,
) {
    let link = match registry.lookup(&service.tunnel_id).await {
        Some(link) => link,
        None => {
            warn!(
                service_id = %service.id,
                tunnel_id = %service.tunnel_id,
                "tunnel not connected, dropping tcp connection"
            );
            return;
        }
    };

    let mut stream =
        match open_service_stream(&link, ServiceKind::Tcp, &service.target_addr, &[]).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(service_id = %service.id, "failed to open tunnel stream: {e}");
                return;
            }
        };

    debug!(
        service_id = %service.id,
        target = %service.target_addr,
        "proxying tcp connection"
    );
    let _ = tokio::io::copy_bidirectional(&mut socket, &mut stream).await;
    debug!(service_id = %service.id, "tcp connection closed");
}
