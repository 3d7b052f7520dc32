//! Registry lifecycle tests with in-memory links and catalog.

use burrow_catalog::{CheckStatus, MemoryCatalog};
use burrow_link::{Link, LinkRole};
use burrow_proto::ControlMessage;
use burrow_registry::TunnelRegistry;
use burrow_transport::{upgrade_raw, FramedTransport, Role};
use std::sync::Arc;
use std::time::Duration;

async fn link_pair() -> (Arc<Link>, Arc<Link>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (server_ws, agent_ws) =
        tokio::join!(upgrade_raw(a, Role::Server), upgrade_raw(b, Role::Client));

    let (transport, ctrl_tx, ctrl_rx) = FramedTransport::new(server_ws);
    let server = Arc::new(Link::new(transport, ctrl_tx, ctrl_rx, LinkRole::Server));

    let (transport, ctrl_tx, ctrl_rx) = FramedTransport::new(agent_ws);
    let agent = Arc::new(Link::new(transport, ctrl_tx, ctrl_rx, LinkRole::Agent));

    (server, agent)
}

/// Answer relay pings the way a healthy agent would.
fn spawn_agent_responder(agent: Arc<Link>) {
    tokio::spawn(async move {
        while let Some(msg) = agent.recv_control().await {
            if let Ok(ControlMessage::Ping) = msg {
                if agent.pong().await.is_err() {
                    break;
                }
            }
        }
    });
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn attach_then_lookup() {
    let catalog = Arc::new(MemoryCatalog::new());
    let registry = TunnelRegistry::new(catalog.clone(), Duration::from_secs(30));

    let (server_link, agent_link) = link_pair().await;
    let reg = registry.clone();
    let handle = tokio::spawn(async move { reg.attach("t1", server_link).await });

    wait_for_async(|| async { registry.is_connected("t1").await }).await;
    assert_eq!(registry.connected_tunnels().await, vec!["t1".to_string()]);
    assert!(registry.lookup("t2").await.is_none());

    agent_link.close();
    handle.await.unwrap();

    assert!(registry.lookup("t1").await.is_none());

    let checks = catalog.checks_for("t1");
    let statuses: Vec<CheckStatus> = checks.iter().rev().map(|c| c.status).collect();
    assert_eq!(statuses, vec![CheckStatus::Up, CheckStatus::Down]);
}

#[tokio::test]
async fn displacement_keeps_only_the_newer_link() {
    let catalog = Arc::new(MemoryCatalog::new());
    let registry = TunnelRegistry::new(catalog.clone(), Duration::from_secs(30));

    let (first_server, _first_agent) = link_pair().await;
    let reg = registry.clone();
    let first_attach = {
        let link = first_server.clone();
        tokio::spawn(async move { reg.attach("t1", link).await })
    };
    wait_for_async(|| async { registry.is_connected("t1").await }).await;

    let (second_server, _second_agent) = link_pair().await;
    let reg = registry.clone();
    let second_attach = {
        let link = second_server.clone();
        tokio::spawn(async move { reg.attach("t1", link).await })
    };

    // The older link dies; its attach task completes without removing the
    // newer registration.
    first_attach.await.unwrap();
    assert!(first_server.is_closed());
    assert!(!second_server.is_closed());

    let live = registry.lookup("t1").await.unwrap();
    assert!(Arc::ptr_eq(&live, &second_server));

    // Ledger order: up (first), down (displaced), up (second).
    let statuses: Vec<CheckStatus> = catalog
        .checks_for("t1")
        .iter()
        .rev()
        .map(|c| c.status)
        .collect();
    assert_eq!(
        statuses,
        vec![CheckStatus::Up, CheckStatus::Down, CheckStatus::Up]
    );
    let checks = catalog.checks_for("t1");
    assert!(checks[1]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("displaced"));

    second_server.close();
    second_attach.await.unwrap();
}

#[tokio::test]
async fn stale_link_is_reaped_by_the_probe() {
    let catalog = Arc::new(MemoryCatalog::new());
    let registry = TunnelRegistry::new(catalog.clone(), Duration::from_millis(50));
    registry.start();

    // The agent never answers pings: its control receiver is simply
    // never read, so the relay link's activity clock stays frozen.
    let (server_link, _agent_link) = link_pair().await;
    let reg = registry.clone();
    let attach = tokio::spawn(async move { reg.attach("t1", server_link).await });

    wait_for_async(|| async { registry.is_connected("t1").await }).await;

    // 3 × 50 ms staleness plus one probe tick, with margin.
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(registry.lookup("t1").await.is_none());
    attach.await.unwrap();

    let checks = catalog.checks_for("t1");
    let down = checks
        .iter()
        .find(|c| c.status == CheckStatus::Down)
        .expect("a down row must exist");
    assert_eq!(down.error.as_deref(), Some("connection timeout"));
    // Exactly one down row despite probe and attach both observing the end.
    assert_eq!(
        checks.iter().filter(|c| c.status == CheckStatus::Down).count(),
        1
    );

    registry.stop().await;
}

#[tokio::test]
async fn probe_pong_produces_latency_sample() {
    let catalog = Arc::new(MemoryCatalog::new());
    let registry = TunnelRegistry::new(catalog.clone(), Duration::from_millis(50));
    registry.start();

    let (server_link, agent_link) = link_pair().await;
    spawn_agent_responder(agent_link);

    let reg = registry.clone();
    let attach = tokio::spawn(async move { reg.attach("t1", server_link).await });

    wait_for(|| {
        catalog
            .checks_for("t1")
            .iter()
            .any(|c| c.status == CheckStatus::Up && c.latency_ms.is_some())
    })
    .await;

    // Healthy link: still registered after several probe rounds.
    assert!(registry.is_connected("t1").await);

    registry.stop().await;
    attach.await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent_and_closes_links() {
    let catalog = Arc::new(MemoryCatalog::new());
    let registry = TunnelRegistry::new(catalog.clone(), Duration::from_secs(30));
    registry.start();

    let (server_link, _agent_link) = link_pair().await;
    let reg = registry.clone();
    let attach = {
        let link = server_link.clone();
        tokio::spawn(async move { reg.attach("t1", link).await })
    };
    wait_for_async(|| async { registry.is_connected("t1").await }).await;

    registry.stop().await;
    registry.stop().await;

    assert!(server_link.is_closed());
    attach.await.unwrap();
}

async fn wait_for_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}
