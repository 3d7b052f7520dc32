//! Live tunnel state.
//!
//! The [`TunnelRegistry`] owns every live [`Link`], keyed by tunnel id, and
//! is the only writer of the check ledger. At most one link exists per
//! tunnel: a newer connection displaces the older one. A background probe
//! pings every link on an interval and reaps the silent ones; a second
//! low-frequency task trims ledger rows past the retention window.

use burrow_catalog::{Catalog, NewCheck};
use burrow_link::Link;
use burrow_proto::ControlMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

pub use burrow_proto::DEFAULT_PING_INTERVAL;

/// How long check rows are kept before the retention task trims them.
pub const CHECK_RETENTION_DAYS: i64 = 180;

/// Cadence of the retention task.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Error text recorded when the probe reaps a silent link.
const STALE_REASON: &str = "connection timeout";

/// Error text recorded for a link displaced by a newer connection.
const DISPLACED_REASON: &str = "displaced by newer connection";

/// Authoritative tunnel-id to live-link map.
pub struct TunnelRegistry {
    links: RwLock<HashMap<String, Arc<Link>>>,
    catalog: Arc<dyn Catalog>,
    ping_interval: Duration,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl TunnelRegistry {
    pub fn new(catalog: Arc<dyn Catalog>, ping_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            links: RwLock::new(HashMap::new()),
            catalog,
            ping_interval,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Start the probe and retention tasks.
    pub fn start(self: &Arc<Self>) {
        info!("starting tunnel registry");
        self.tasks.spawn(self.clone().probe_loop());
        self.tasks.spawn(self.clone().retention_loop());
    }

    /// Drive one registered link until it closes.
    ///
    /// Registers the link (displacing any predecessor), answers its pings,
    /// converts its pongs into ledger samples, and on exit removes it and
    /// records the `down` transition. One call per accepted connection;
    /// the caller owns the task this runs on.
    pub async fn attach(&self, tunnel_id: &str, link: Arc<Link>) {
        self.register(tunnel_id, link.clone()).await;
        self.control_loop(tunnel_id, &link).await;
        link.close();
        self.deregister(tunnel_id, &link, None).await;
    }

    /// Current live link for a tunnel, if any. Never blocks on I/O.
    pub async fn lookup(&self, tunnel_id: &str) -> Option<Arc<Link>> {
        let links = self.links.read().await;
        links.get(tunnel_id).filter(|l| !l.is_closed()).cloned()
    }

    pub async fn is_connected(&self, tunnel_id: &str) -> bool {
        self.lookup(tunnel_id).await.is_some()
    }

    /// Ids of all tunnels with a live link.
    pub async fn connected_tunnels(&self) -> Vec<String> {
        let links = self.links.read().await;
        links
            .iter()
            .filter(|(_, l)| !l.is_closed())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Shut the registry down: every link closes, background tasks exit.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("stopping tunnel registry");
        self.shutdown.cancel();

        let links: Vec<Arc<Link>> = {
            let map = self.links.read().await;
            map.values().cloned().collect()
        };
        for link in links {
            link.close();
        }

        self.tasks.close();
        self.tasks.wait().await;
    }

    // ---- internals ----

    async fn register(&self, tunnel_id: &str, link: Arc<Link>) {
        let displaced = {
            let mut links = self.links.write().await;
            links.insert(tunnel_id.to_string(), link)
        };

        if let Some(old) = displaced {
            info!(tunnel_id, "displacing existing link");
            old.close();
            self.record(NewCheck::down(
                tunnel_id,
                Some(DISPLACED_REASON.to_string()),
            ))
            .await;
        }

        info!(tunnel_id, "registered link");
        self.record(NewCheck::up(tunnel_id)).await;
    }

    /// Remove the link and append its `down` row, but only while the map
    /// still holds *this* link. A displaced or probe-reaped link was
    /// already removed and accounted for.
    async fn deregister(&self, tunnel_id: &str, link: &Arc<Link>, error: Option<String>) {
        let removed = {
            let mut links = self.links.write().await;
            match links.get(tunnel_id) {
                Some(current) if Arc::ptr_eq(current, link) => {
                    links.remove(tunnel_id);
                    true
                }
                _ => false,
            }
        };

        if removed {
            info!(tunnel_id, "deregistered link");
            self.record(NewCheck::down(tunnel_id, error)).await;
        }
    }

    async fn control_loop(&self, tunnel_id: &str, link: &Arc<Link>) {
        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                msg = link.recv_control() => msg,
            };

            match msg {
                None => return,
                Some(Ok(ControlMessage::Ping)) => {
                    if link.pong().await.is_err() {
                        return;
                    }
                }
                Some(Ok(ControlMessage::Pong)) => {
                    // recv_control already refreshed the activity clock;
                    // a pending probe ping becomes a latency sample.
                    if let Some(rtt) = link.take_ping_rtt() {
                        self.record(NewCheck::up_with_latency(
                            tunnel_id,
                            rtt.as_millis() as i32,
                        ))
                        .await;
                    }
                }
                Some(Err(e)) => {
                    warn!(tunnel_id, "ignoring control message: {e}");
                }
            }
        }
    }

    async fn probe_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.ping_interval,
            self.ping_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.probe_once().await;
        }
    }

    /// One probe pass over a snapshot of the registry. The lock is never
    /// held across I/O.
    async fn probe_once(&self) {
        let snapshot: Vec<(String, Arc<Link>)> = {
            let links = self.links.read().await;
            links
                .iter()
                .map(|(id, link)| (id.clone(), link.clone()))
                .collect()
        };

        for (tunnel_id, link) in snapshot {
            if link.is_closed() {
                continue;
            }

            if link.last_activity().elapsed() > self.ping_interval * 3 {
                warn!(tunnel_id, "link is stale, closing");
                self.reap(&tunnel_id, &link, STALE_REASON).await;
                continue;
            }

            if let Err(e) = link.ping().await {
                warn!(tunnel_id, "ping failed: {e}");
                self.reap(&tunnel_id, &link, &e.to_string()).await;
            }
        }
    }

    /// Probe-side removal: take the entry out first so the attach loop's
    /// deregister does not double-record, then close and write the row.
    async fn reap(&self, tunnel_id: &str, link: &Arc<Link>, reason: &str) {
        let removed = {
            let mut links = self.links.write().await;
            match links.get(tunnel_id) {
                Some(current) if Arc::ptr_eq(current, link) => {
                    links.remove(tunnel_id);
                    true
                }
                _ => false,
            }
        };

        link.close();
        if removed {
            self.record(NewCheck::down(tunnel_id, Some(reason.to_string())))
                .await;
        }
    }

    async fn retention_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + RETENTION_SWEEP_INTERVAL,
            RETENTION_SWEEP_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let cutoff = chrono::Utc::now() - chrono::Duration::days(CHECK_RETENTION_DAYS);
            match self.catalog.trim_checks_older_than(cutoff).await {
                Ok(0) => {}
                Ok(n) => info!("trimmed {n} old checks"),
                Err(e) => warn!("check trim failed: {e}"),
            }
        }
    }

    /// Ledger writes must never take a link down with them.
    async fn record(&self, check: NewCheck) {
        if let Err(e) = self.catalog.append_check(check).await {
            warn!("failed to record check: {e}");
        }
    }
}

impl std::fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("ping_interval", &self.ping_interval)
            .finish()
    }
}
