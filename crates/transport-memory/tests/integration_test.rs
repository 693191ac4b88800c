//! Integration tests for the in-memory transport

use std::time::Duration;

use bytes::Bytes;
use weave_topology::{NodeAddress, NodeId};
use weave_transport::{Message, MessageType, Transport, TransportError};
use weave_transport_memory::{MemoryHub, MemoryTransport};

fn addr(port: u16) -> NodeAddress {
    NodeAddress::new("mem", port)
}

#[tokio::test]
async fn connect_and_exchange() {
    let hub = MemoryHub::new();
    let t1 = MemoryTransport::new(hub.clone(), addr(1));
    let t2 = MemoryTransport::new(hub.clone(), addr(2));
    t1.start().await.unwrap();
    t2.start().await.unwrap();

    let conn = t1.connect(&addr(2)).await.unwrap();
    assert!(t1.bind_peer(conn, NodeId::new(2)));

    let msg = Message::new(
        MessageType::DataMessage,
        NodeId::new(1),
        NodeId::new(2),
        Bytes::from_static(b"ping"),
    );
    t1.send_to_peer(NodeId::new(2), &msg).await.unwrap();

    let inbound = tokio::time::timeout(Duration::from_secs(2), t2.incoming().recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbound.message, msg);
    assert!(t2.is_connected(NodeId::new(1)));
}

#[tokio::test]
async fn double_bind_of_address_fails() {
    let hub = MemoryHub::new();
    let t1 = MemoryTransport::new(hub.clone(), addr(7));
    let t2 = MemoryTransport::new(hub.clone(), addr(7));
    t1.start().await.unwrap();
    assert!(matches!(
        t2.start().await,
        Err(TransportError::Bind { .. })
    ));
}

#[tokio::test]
async fn blackhole_swallows_sends() {
    let hub = MemoryHub::new();
    let t1 = MemoryTransport::new(hub.clone(), addr(1));
    let t2 = MemoryTransport::new(hub.clone(), addr(2));
    t1.start().await.unwrap();
    t2.start().await.unwrap();

    let conn = t1.connect(&addr(2)).await.unwrap();
    t1.bind_peer(conn, NodeId::new(2));
    t1.set_blackhole(NodeId::new(2), true);

    let msg = Message::new(
        MessageType::Heartbeat,
        NodeId::new(1),
        NodeId::new(2),
        Bytes::new(),
    );
    // The send reports success but nothing arrives.
    t1.send_to_peer(NodeId::new(2), &msg).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(200), t2.incoming().recv_async()).await;
    assert!(outcome.is_err());
}

#[tokio::test]
async fn connect_to_unknown_address_fails() {
    let hub = MemoryHub::new();
    let t1 = MemoryTransport::new(hub.clone(), addr(1));
    t1.start().await.unwrap();
    assert!(matches!(
        t1.connect(&addr(9)).await,
        Err(TransportError::Connect { .. })
    ));
}
