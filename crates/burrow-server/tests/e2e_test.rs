//! Full-stack scenarios: relay + agent + real sockets on loopback.

use burrow_agent::{Agent, AgentConfig, BackoffConfig};
use burrow_catalog::{Catalog, CheckStatus, MemoryCatalog, NewService, Service, TlsMode, Tunnel};
use burrow_proto::ServiceKind;
use burrow_server::{Server, ServerConfig};
use burrow_transport::{connect, ConnectOptions, FramedTransport, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

struct TestRelay {
    server: Server,
    catalog: Arc<MemoryCatalog>,
    tunnel: Tunnel,
}

async fn start_relay(ping_interval: Duration) -> TestRelay {
    let catalog = Arc::new(MemoryCatalog::new());
    let tunnel = catalog.create_tunnel("test").unwrap();

    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        tunnel_addr: "127.0.0.1:0".parse().unwrap(),
        http_addr: Some("127.0.0.1:0".parse().unwrap()),
        https_addr: None,
        data_dir: std::env::temp_dir(),
        domain: None,
        ping_interval,
        ..ServerConfig::default()
    };

    let server = Server::start(config, catalog.clone() as Arc<dyn Catalog>, None)
        .await
        .unwrap();

    TestRelay {
        server,
        catalog,
        tunnel,
    }
}

fn spawn_agent(relay: &TestRelay) -> (Arc<Agent>, CancellationToken) {
    let mut config = AgentConfig::new(
        relay.server.tunnel_addr().to_string(),
        relay.tunnel.token.clone(),
    );
    config.plaintext = true;
    config.ping_interval = Duration::from_millis(200);
    config.backoff = BackoffConfig {
        initial: Duration::from_millis(50),
        max: Duration::from_millis(200),
        max_attempts: None,
    };

    let agent = Arc::new(Agent::new(config));
    let stop = agent.shutdown_token();
    let run_agent = agent.clone();
    tokio::spawn(async move {
        let _ = run_agent.run().await;
    });
    (agent, stop)
}

async fn wait_until_connected(relay: &TestRelay) {
    for _ in 0..200 {
        if relay.server.registry().is_connected(&relay.tunnel.id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent did not connect within 2s");
}

/// Minimal HTTP origin returning `200 OK` with a fixed body.
async fn spawn_http_origin(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    seen.extend_from_slice(&buf[..n]);
                    if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

fn new_http_service(tunnel_id: &str, domain: &str, target: SocketAddr) -> NewService {
    NewService {
        tunnel_id: tunnel_id.to_string(),
        kind: ServiceKind::Http,
        domain: Some(domain.to_string()),
        path_prefix: None,
        tls_mode: TlsMode::Terminate,
        listen_addr: None,
        target_addr: target.to_string(),
        enabled: true,
    }
}

fn new_tcp_service(tunnel_id: &str, target: SocketAddr) -> Service {
    Service {
        id: uuid_like(),
        tunnel_id: tunnel_id.to_string(),
        kind: ServiceKind::Tcp,
        domain: None,
        path_prefix: "/".to_string(),
        tls_mode: TlsMode::Terminate,
        listen_addr: Some("127.0.0.1:0".to_string()),
        target_addr: target.to_string(),
        enabled: true,
        created_at: chrono_now(),
    }
}

fn uuid_like() -> String {
    format!("svc-{:08x}", std::process::id())
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

async fn http_request(addr: SocketAddr, host: &str, path: &str) -> String {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let request =
        format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    socket.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    socket.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test]
async fn http_happy_path() {
    let relay = start_relay(Duration::from_secs(30)).await;
    let origin = spawn_http_origin("hello").await;
    relay
        .catalog
        .create_service(new_http_service(&relay.tunnel.id, "app.example.com", origin))
        .unwrap();

    let (_agent, stop) = spawn_agent(&relay);
    wait_until_connected(&relay).await;

    let response = http_request(
        relay.server.http_addr().unwrap(),
        "app.example.com",
        "/",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("hello"));

    // The request's stream has wound down; the link is still up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let link = relay
        .server
        .registry()
        .lookup(&relay.tunnel.id)
        .await
        .unwrap();
    assert_eq!(link.active_streams().await, 0);

    stop.cancel();
    relay.server.stop().await;
}

#[tokio::test]
async fn http_unknown_host_is_404() {
    let relay = start_relay(Duration::from_secs(30)).await;
    let (_agent, stop) = spawn_agent(&relay);
    wait_until_connected(&relay).await;

    let response = http_request(
        relay.server.http_addr().unwrap(),
        "nobody.example.com",
        "/",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404"));

    stop.cancel();
    relay.server.stop().await;
}

#[tokio::test]
async fn http_path_prefix_mismatch_is_404() {
    let relay = start_relay(Duration::from_secs(30)).await;
    let origin = spawn_http_origin("hidden").await;
    let mut service = new_http_service(&relay.tunnel.id, "app.example.com", origin);
    service.path_prefix = Some("/api".to_string());
    relay.catalog.create_service(service).unwrap();

    let (_agent, stop) = spawn_agent(&relay);
    wait_until_connected(&relay).await;

    let addr = relay.server.http_addr().unwrap();
    let response = http_request(addr, "app.example.com", "/other").await;
    assert!(response.starts_with("HTTP/1.1 404"));

    let response = http_request(addr, "app.example.com", "/api/data").await;
    assert!(response.starts_with("HTTP/1.1 200"));

    stop.cancel();
    relay.server.stop().await;
}

#[tokio::test]
async fn no_agent_means_503_and_no_ledger_row() {
    let relay = start_relay(Duration::from_secs(30)).await;
    let origin = spawn_http_origin("never").await;
    relay
        .catalog
        .create_service(new_http_service(&relay.tunnel.id, "app.example.com", origin))
        .unwrap();

    let response = http_request(
        relay.server.http_addr().unwrap(),
        "app.example.com",
        "/",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 503"));

    // No link ever existed, so no check row was created.
    assert!(relay.catalog.checks_for(&relay.tunnel.id).is_empty());

    relay.server.stop().await;
}

#[tokio::test]
async fn tcp_happy_path() {
    let relay = start_relay(Duration::from_secs(30)).await;
    let echo = spawn_echo_server().await;
    let service = new_tcp_service(&relay.tunnel.id, echo);

    let bound = relay.server.tcp_ingress().add_service(&service).await.unwrap();

    let (_agent, stop) = spawn_agent(&relay);
    wait_until_connected(&relay).await;

    let mut client = TcpStream::connect(bound).await.unwrap();
    client.write_all(b"PING\n").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING\n");

    stop.cancel();
    relay.server.stop().await;
}

#[tokio::test]
async fn displacement_keeps_the_newer_agent() {
    let relay = start_relay(Duration::from_secs(30)).await;
    let echo = spawn_echo_server().await;
    let service = new_tcp_service(&relay.tunnel.id, echo);
    let bound = relay.server.tcp_ingress().add_service(&service).await.unwrap();

    let (_first, first_stop) = spawn_agent(&relay);
    wait_until_connected(&relay).await;
    let first_link = relay
        .server
        .registry()
        .lookup(&relay.tunnel.id)
        .await
        .unwrap();

    // A connection proxied through the first agent.
    let mut inflight = TcpStream::connect(bound).await.unwrap();
    inflight.write_all(b"hold\n").await.unwrap();
    let mut buf = [0u8; 5];
    inflight.read_exact(&mut buf).await.unwrap();

    // Second agent with the same token displaces the first.
    let (_second, second_stop) = spawn_agent(&relay);
    for _ in 0..200 {
        if first_link.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(first_link.is_closed());

    // Exactly one live link remains, and it is not the first one.
    let live = relay
        .server
        .registry()
        .lookup(&relay.tunnel.id)
        .await
        .expect("newer link must be live");
    assert!(!Arc::ptr_eq(&live, &first_link));

    // The in-flight connection through the displaced link aborts.
    let mut rest = Vec::new();
    let outcome = inflight.read_to_end(&mut rest).await;
    assert!(outcome.is_err() || rest.is_empty());

    // Ledger order for the displacement: ..., down (displaced), up (new).
    let checks = relay.catalog.checks_for(&relay.tunnel.id);
    let statuses: Vec<CheckStatus> = checks.iter().rev().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        vec![CheckStatus::Up, CheckStatus::Down, CheckStatus::Up]
    );

    first_stop.cancel();
    second_stop.cancel();
    relay.server.stop().await;
}

#[tokio::test]
async fn frozen_agent_is_reaped_and_ingress_returns_503() {
    let relay = start_relay(Duration::from_millis(100)).await;
    let origin = spawn_http_origin("frozen").await;
    relay
        .catalog
        .create_service(new_http_service(&relay.tunnel.id, "app.example.com", origin))
        .unwrap();

    // A "frozen" agent: completes the handshake but never reads control
    // messages or answers pings.
    let opts = ConnectOptions {
        server_addr: relay.server.tunnel_addr().to_string(),
        token: relay.tunnel.token.clone(),
        plaintext: true,
        insecure: false,
    };
    let ws = connect(&opts).await.unwrap();
    let frozen = FramedTransport::new(ws);

    wait_until_connected(&relay).await;

    // Stale after 3 × 100 ms; reaped by the next probe tick.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!relay.server.registry().is_connected(&relay.tunnel.id).await);

    let response = http_request(
        relay.server.http_addr().unwrap(),
        "app.example.com",
        "/",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 503"));

    let checks = relay.catalog.checks_for(&relay.tunnel.id);
    let downs: Vec<_> = checks
        .iter()
        .filter(|c| c.status == CheckStatus::Down)
        .collect();
    assert_eq!(downs.len(), 1);
    assert_eq!(downs[0].error.as_deref(), Some("connection timeout"));

    drop(frozen);
    relay.server.stop().await;
}

#[tokio::test]
async fn invalid_token_is_refused_with_401_before_upgrade() {
    let relay = start_relay(Duration::from_secs(30)).await;

    let opts = ConnectOptions {
        server_addr: relay.server.tunnel_addr().to_string(),
        token: "not-a-real-token".to_string(),
        plaintext: true,
        insecure: false,
    };

    // The relay checks the token against the catalog before completing the
    // upgrade, so the handshake itself fails with an http 401.
    let err = connect(&opts).await.expect_err("handshake must be refused");
    match err {
        TransportError::WebSocket(msg) => {
            assert!(msg.contains("401"), "expected a 401 refusal, got: {msg}");
        }
        other => panic!("expected an http refusal, got: {other}"),
    }

    assert!(!relay.server.registry().is_connected(&relay.tunnel.id).await);
    assert!(relay.catalog.checks_for(&relay.tunnel.id).is_empty());

    relay.server.stop().await;
}

#[tokio::test]
async fn missing_token_is_refused_with_401_before_upgrade() {
    let relay = start_relay(Duration::from_secs(30)).await;

    let opts = ConnectOptions {
        server_addr: relay.server.tunnel_addr().to_string(),
        token: String::new(),
        plaintext: true,
        insecure: false,
    };

    let err = connect(&opts).await.expect_err("handshake must be refused");
    match err {
        TransportError::WebSocket(msg) => {
            assert!(msg.contains("401"), "expected a 401 refusal, got: {msg}");
        }
        other => panic!("expected an http refusal, got: {other}"),
    }

    relay.server.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    let relay = start_relay(Duration::from_secs(30)).await;
    relay.server.stop().await;
    relay.server.stop().await;
}
