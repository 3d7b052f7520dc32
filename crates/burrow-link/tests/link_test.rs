//! Link behavior over an in-memory WebSocket pair.

use burrow_link::{Link, LinkError, LinkRole};
use burrow_proto::ControlMessage;
use burrow_transport::{upgrade_raw, FramedTransport, Role};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn link_pair() -> (Link, Link) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (server_ws, agent_ws) =
        tokio::join!(upgrade_raw(a, Role::Server), upgrade_raw(b, Role::Client));

    let (transport, ctrl_tx, ctrl_rx) = FramedTransport::new(server_ws);
    let server = Link::new(transport, ctrl_tx, ctrl_rx, LinkRole::Server);

    let (transport, ctrl_tx, ctrl_rx) = FramedTransport::new(agent_ws);
    let agent = Link::new(transport, ctrl_tx, ctrl_rx, LinkRole::Agent);

    (server, agent)
}

#[tokio::test]
async fn stream_round_trip() {
    let (server, agent) = link_pair().await;

    let mut outbound = server.open_stream().await.unwrap();
    outbound.write_all(b"request bytes").await.unwrap();

    let mut inbound = agent.accept_stream().await.unwrap();
    let mut buf = [0u8; 13];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"request bytes");

    inbound.write_all(b"response").await.unwrap();
    let mut buf = [0u8; 8];
    outbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"response");
}

#[tokio::test]
async fn half_close_propagates_as_eof() {
    let (server, agent) = link_pair().await;

    let mut outbound = server.open_stream().await.unwrap();
    outbound.write_all(b"all of it").await.unwrap();
    outbound.shutdown().await.unwrap();

    let mut inbound = agent.accept_stream().await.unwrap();
    let mut collected = Vec::new();
    inbound.read_to_end(&mut collected).await.unwrap();
    assert_eq!(collected, b"all of it");

    // The reverse direction still works after the forward half closed.
    inbound.write_all(b"still open").await.unwrap();
    let mut buf = [0u8; 10];
    outbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still open");
}

#[tokio::test]
async fn streams_are_independent() {
    let (server, agent) = link_pair().await;

    let mut s1 = server.open_stream().await.unwrap();
    let mut s2 = server.open_stream().await.unwrap();
    assert_ne!(s1.id(), s2.id());

    s1.write_all(b"one").await.unwrap();
    s2.write_all(b"two").await.unwrap();

    let mut a1 = agent.accept_stream().await.unwrap();
    let mut a2 = agent.accept_stream().await.unwrap();

    // Streams arrive in open order since the first frame creates them.
    let mut buf = [0u8; 3];
    a1.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"one");
    a2.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two");
}

#[tokio::test]
async fn bulk_transfer_preserves_order() {
    let (server, agent) = link_pair().await;

    let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let mut outbound = server.open_stream().await.unwrap();
    let writer = tokio::spawn(async move {
        outbound.write_all(&payload).await.unwrap();
        outbound.shutdown().await.unwrap();
    });

    let mut inbound = agent.accept_stream().await.unwrap();
    let mut collected = Vec::new();
    inbound.read_to_end(&mut collected).await.unwrap();
    writer.await.unwrap();

    assert_eq!(collected.len(), expected.len());
    assert_eq!(collected, expected);
}

#[tokio::test]
async fn control_ping_pong_and_activity() {
    let (server, agent) = link_pair().await;

    let before = server.last_activity();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    server.ping().await.unwrap();
    let msg = agent.recv_control().await.unwrap().unwrap();
    assert_eq!(msg, ControlMessage::Ping);

    agent.pong().await.unwrap();
    let msg = server.recv_control().await.unwrap().unwrap();
    assert_eq!(msg, ControlMessage::Pong);

    assert!(server.last_activity() > before);
    assert!(server.take_ping_rtt().is_some());
    // Consumed: a second take yields nothing.
    assert!(server.take_ping_rtt().is_none());
}

#[tokio::test]
async fn close_is_idempotent() {
    let (server, _agent) = link_pair().await;

    server.close();
    server.close();
    server.close();
    assert!(server.is_closed());
}

#[tokio::test]
async fn operations_fail_after_close() {
    let (server, agent) = link_pair().await;

    let mut stream = server.open_stream().await.unwrap();
    stream.write_all(b"x").await.unwrap();
    let _inbound = agent.accept_stream().await.unwrap();

    server.close();

    assert!(matches!(
        server.open_stream().await,
        Err(LinkError::Closed)
    ));
    assert!(matches!(
        server.accept_stream().await,
        Err(LinkError::Closed)
    ));
    assert!(server.send_control(ControlMessage::Ping).await.is_err());

    // The stream opened before the close now errors too.
    let mut buf = [0u8; 1];
    assert!(stream.read_exact(&mut buf).await.is_err());
}

#[tokio::test]
async fn peer_close_surfaces_on_existing_streams() {
    let (server, agent) = link_pair().await;

    let mut outbound = server.open_stream().await.unwrap();
    outbound.write_all(b"hello").await.unwrap();
    let mut inbound = agent.accept_stream().await.unwrap();
    let mut buf = [0u8; 5];
    inbound.read_exact(&mut buf).await.unwrap();

    server.close();
    agent.closed().await;

    let mut rest = [0u8; 1];
    assert!(inbound.read_exact(&mut rest).await.is_err());
}

#[tokio::test]
async fn no_stream_outlives_its_link_silently() {
    let (server, agent) = link_pair().await;

    let mut outbound = server.open_stream().await.unwrap();
    outbound.write_all(b"probe").await.unwrap();
    let _ = agent.accept_stream().await.unwrap();

    agent.close();
    server.closed().await;

    let mut buf = [0u8; 1];
    let read = outbound.read_exact(&mut buf).await;
    assert!(read.is_err());
}
