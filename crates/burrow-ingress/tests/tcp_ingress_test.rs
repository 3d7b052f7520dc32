//! TCP ingress: listener lifecycle and end-to-end forwarding with a
//! hand-rolled agent loop.

use burrow_catalog::{MemoryCatalog, NewService, Service, TlsMode};
use burrow_ingress::{IngressError, TcpIngress};
use burrow_link::{Link, LinkRole};
use burrow_proto::{ServiceKind, StreamHeader};
use burrow_registry::TunnelRegistry;
use burrow_transport::{upgrade_raw, FramedTransport, Role};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

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

/// Minimal agent: accept streams, read the header, dial the target, copy.
fn spawn_manual_agent(agent: Arc<Link>) {
    tokio::spawn(async move {
        while let Ok(mut stream) = agent.accept_stream().await {
            tokio::spawn(async move {
                let header = match StreamHeader::read_from(&mut stream).await {
                    Ok(header) => header,
                    Err(_) => return,
                };
                let mut target = match TcpStream::connect(&header.target).await {
                    Ok(target) => target,
                    Err(_) => return,
                };
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut target).await;
            });
        }
    });
}

/// Loopback echo server; returns its address.
async fn spawn_echo_server() -> std::net::SocketAddr {
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

fn tcp_service(catalog: &MemoryCatalog, tunnel_id: &str, listen: &str, target: &str) -> Service {
    catalog
        .create_service(NewService {
            tunnel_id: tunnel_id.to_string(),
            kind: ServiceKind::Tcp,
            domain: None,
            path_prefix: None,
            tls_mode: TlsMode::Terminate,
            listen_addr: Some(listen.to_string()),
            target_addr: target.to_string(),
            enabled: true,
        })
        .unwrap()
}

#[tokio::test]
async fn forwards_bytes_through_the_tunnel() {
    let catalog = Arc::new(MemoryCatalog::new());
    let tunnel = catalog.create_tunnel("db").unwrap();
    let registry = TunnelRegistry::new(catalog.clone(), Duration::from_secs(30));

    let (server_link, agent_link) = link_pair().await;
    spawn_manual_agent(agent_link);
    let reg = registry.clone();
    let tunnel_id = tunnel.id.clone();
    tokio::spawn(async move { reg.attach(&tunnel_id, server_link).await });

    // Wait for registration.
    while !registry.is_connected(&tunnel.id).await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let echo = spawn_echo_server().await;
    let service = tcp_service(&catalog, &tunnel.id, "127.0.0.1:0", &echo.to_string());

    let shutdown = CancellationToken::new();
    let ingress = TcpIngress::new(registry.clone(), shutdown.clone());
    let bound = ingress.add_service(&service).await.unwrap();

    let mut client = TcpStream::connect(bound).await.unwrap();
    client.write_all(b"PING\n").await.unwrap();

    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING\n");

    // Closing the client closes the remote side; the echo server sees eof
    // and the tunnel stream winds down without killing the link.
    drop(client);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(registry.is_connected(&tunnel.id).await);

    shutdown.cancel();
    ingress.shutdown_all();
}

#[tokio::test]
async fn connection_dropped_when_tunnel_offline() {
    let catalog = Arc::new(MemoryCatalog::new());
    let tunnel = catalog.create_tunnel("db").unwrap();
    let registry = TunnelRegistry::new(catalog.clone(), Duration::from_secs(30));

    let service = tcp_service(&catalog, &tunnel.id, "127.0.0.1:0", "127.0.0.1:9");

    let shutdown = CancellationToken::new();
    let ingress = TcpIngress::new(registry, shutdown.clone());
    let bound = ingress.add_service(&service).await.unwrap();

    let mut client = TcpStream::connect(bound).await.unwrap();
    // No tunnel: the relay closes without writing anything.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    shutdown.cancel();
    ingress.shutdown_all();
}

#[tokio::test]
async fn duplicate_listen_addr_is_rejected() {
    let catalog = Arc::new(MemoryCatalog::new());
    let tunnel = catalog.create_tunnel("db").unwrap();
    let registry = TunnelRegistry::new(catalog.clone(), Duration::from_secs(30));

    let service = tcp_service(&catalog, &tunnel.id, "127.0.0.1:0", "127.0.0.1:9");

    let shutdown = CancellationToken::new();
    let ingress = TcpIngress::new(registry, shutdown.clone());
    ingress.add_service(&service).await.unwrap();

    let err = ingress.add_service(&service).await.unwrap_err();
    assert!(matches!(err, IngressError::AlreadyBound(_)));

    ingress.shutdown_all();
}

#[tokio::test]
async fn remove_closes_the_listener() {
    let catalog = Arc::new(MemoryCatalog::new());
    let tunnel = catalog.create_tunnel("db").unwrap();
    let registry = TunnelRegistry::new(catalog.clone(), Duration::from_secs(30));

    let service = tcp_service(&catalog, &tunnel.id, "127.0.0.1:0", "127.0.0.1:9");

    let shutdown = CancellationToken::new();
    let ingress = TcpIngress::new(registry, shutdown.clone());
    let bound = ingress.add_service(&service).await.unwrap();
    assert_eq!(ingress.bound_addrs().len(), 1);

    ingress.remove_service(service.listen_addr.as_deref().unwrap());
    assert!(ingress.bound_addrs().is_empty());

    // The port is released: a fresh bind on the same address succeeds.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let rebind = TcpListener::bind(bound).await;
    assert!(rebind.is_ok());
}

#[tokio::test]
async fn disabled_or_http_services_are_refused() {
    let catalog = Arc::new(MemoryCatalog::new());
    let tunnel = catalog.create_tunnel("web").unwrap();
    let registry = TunnelRegistry::new(catalog.clone(), Duration::from_secs(30));

    let http = catalog
        .create_service(NewService {
            tunnel_id: tunnel.id.clone(),
            kind: ServiceKind::Http,
            domain: Some("app.example.com".to_string()),
            path_prefix: None,
            tls_mode: TlsMode::Terminate,
            listen_addr: None,
            target_addr: "127.0.0.1:3000".to_string(),
            enabled: true,
        })
        .unwrap();

    let ingress = TcpIngress::new(registry, CancellationToken::new());
    let err = ingress.add_service(&http).await.unwrap_err();
    assert!(matches!(err, IngressError::NotTcpService(_)));
}
