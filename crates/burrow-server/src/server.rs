//! The relay server.

use crate::{ServerConfig, ServerError};
use burrow_catalog::Catalog;
use burrow_ingress::{CertProvider, HttpIngress, HttpsIngress, TcpIngress};
use burrow_link::{Link, LinkRole};
use burrow_registry::TunnelRegistry;
use burrow_transport::{FramedTransport, IncomingTunnel, TunnelListener};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Grace period for in-flight work during shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// A started relay. Dropping it does not stop it; call [`Server::stop`].
pub struct Server {
    registry: Arc<TunnelRegistry>,
    tcp_ingress: Arc<TcpIngress>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    tunnel_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    https_addr: Option<SocketAddr>,
}

impl Server {
    /// Bind everything and start serving.
    ///
    /// The catalog and the certificate provider are collaborators handed
    /// in from outside; the HTTPS ingress only starts when both an
    /// `https_addr` and a provider are present.
    pub async fn start(
        config: ServerConfig,
        catalog: Arc<dyn Catalog>,
        certs: Option<Arc<dyn CertProvider>>,
    ) -> Result<Server, ServerError> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        let registry = TunnelRegistry::new(catalog.clone(), config.ping_interval);
        registry.start();

        // Agent-facing tunnel endpoint. TLS when a provider and a public
        // domain are configured, plain ws otherwise.
        let tunnel_tls = match (&certs, &config.domain) {
            (Some(provider), Some(domain)) => {
                let tls_config = provider.server_config(domain).await?;
                Some(TlsAcceptor::from(tls_config))
            }
            _ => None,
        };
        let tunnel_listener =
            TunnelListener::bind(config.tunnel_addr, tunnel_tls, catalog.clone()).await?;
        let tunnel_addr = tunnel_listener.local_addr()?;
        tasks.spawn(tunnel_accept_loop(
            tunnel_listener,
            registry.clone(),
            shutdown.clone(),
        ));

        // HTTP ingress.
        let mut http_addr = None;
        if let Some(bind) = config.http_addr {
            let ingress = HttpIngress::bind(bind, catalog.clone(), registry.clone()).await?;
            http_addr = Some(ingress.local_addr()?);
            let token = shutdown.clone();
            tasks.spawn(async move { ingress.run(token).await });
        }

        // HTTPS ingress.
        let mut https_addr = None;
        if let Some(bind) = config.https_addr {
            match &certs {
                Some(provider) => {
                    let ingress = HttpsIngress::bind(
                        bind,
                        catalog.clone(),
                        registry.clone(),
                        provider.clone(),
                    )
                    .await?;
                    https_addr = Some(ingress.local_addr()?);
                    let token = shutdown.clone();
                    tasks.spawn(async move { ingress.run(token).await });
                }
                None => {
                    warn!("https ingress configured without a certificate provider; skipping");
                }
            }
        }

        // TCP ingress for every enabled service.
        let tcp_ingress = Arc::new(TcpIngress::new(registry.clone(), shutdown.clone()));
        tcp_ingress.start_all(&catalog).await?;

        info!("relay started; tunnel endpoint on {tunnel_addr}");
        Ok(Server {
            registry,
            tcp_ingress,
            shutdown,
            tasks,
            tunnel_addr,
            http_addr,
            https_addr,
        })
    }

    /// The live-link registry, for management surfaces and tests.
    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// The TCP listener map, mutated when services change.
    pub fn tcp_ingress(&self) -> &Arc<TcpIngress> {
        &self.tcp_ingress
    }

    pub fn tunnel_addr(&self) -> SocketAddr {
        self.tunnel_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    /// Stop everything: listeners close, links close, the probe exits.
    /// In-flight proxied connections get the shutdown grace period, then
    /// are abandoned. Safe to call more than once.
    pub async fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("stopping relay");

        self.shutdown.cancel();
        self.tcp_ingress.shutdown_all();
        self.registry.stop().await;

        self.tasks.close();
        if tokio::time::timeout(SHUTDOWN_DEADLINE, self.tasks.wait())
            .await
            .is_err()
        {
            warn!("shutdown deadline reached; abandoning remaining tasks");
        }

        info!("relay stopped");
    }
}

async fn tunnel_accept_loop(
    listener: TunnelListener,
    registry: Arc<TunnelRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => return,
            incoming = listener.accept() => incoming,
        };

        let incoming = match incoming {
            Ok(incoming) => incoming,
            Err(e) => {
                error!("tunnel endpoint accept failed: {e}");
                return;
            }
        };

        let registry = registry.clone();
        tokio::spawn(handle_tunnel(incoming, registry));
    }
}

/// Drive one authenticated tunnel connection; the listener already
/// resolved the token to its tunnel before the upgrade completed.
async fn handle_tunnel(incoming: IncomingTunnel, registry: Arc<TunnelRegistry>) {
    let peer = incoming.peer;
    let tunnel = incoming.tunnel;

    info!(%peer, tunnel_id = %tunnel.id, tunnel_name = %tunnel.name, "tunnel connected");

    let (transport, ctrl_tx, ctrl_rx) = FramedTransport::new(incoming.ws);
    let link = Arc::new(Link::new(transport, ctrl_tx, ctrl_rx, LinkRole::Server));

    registry.attach(&tunnel.id, link).await;
    info!(tunnel_id = %tunnel.id, "tunnel disconnected");
}
