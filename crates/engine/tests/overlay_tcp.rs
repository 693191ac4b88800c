//! End-to-end engine test over real TCP sockets

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use weave_engine::{EngineConfig, Event, OverlayEngine, RegistrationStatus, SequenceIds};
use weave_topology::{NodeAddress, NodeId};
use weave_transport_tcp::{TcpConfig, TcpTransport};
use weave_util::port_allocator::allocate_port;

fn tcp_engine(raw_id: u64, port: u16) -> OverlayEngine<TcpTransport> {
    let transport = Arc::new(TcpTransport::new(TcpConfig {
        listen: NodeAddress::new("127.0.0.1", port),
        ..TcpConfig::default()
    }));
    OverlayEngine::with_ids(
        transport,
        EngineConfig::default(),
        Arc::new(SequenceIds::starting_at(raw_id * 1_000)),
        Some(NodeId::new(raw_id)),
    )
}

#[tokio::test]
async fn join_and_exchange_over_tcp() {
    let port1 = allocate_port();
    let port2 = allocate_port();
    let n1 = tcp_engine(1, port1);
    let n2 = tcp_engine(2, port2);

    let addr1 = n1.start().await.unwrap();
    n2.start().await.unwrap();

    let mut events_1 = n1.events();
    n2.join(&addr1).await.unwrap();

    // Wait until the responder has admitted the joiner.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if n2.registration().status() == RegistrationStatus::Registered
            && n1.topology().lock().unwrap().contains(NodeId::new(2))
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "handshake did not finish"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The responder registered the joiner under its listen address.
    let registered = n1
        .topology()
        .lock()
        .unwrap()
        .address_of(NodeId::new(2))
        .unwrap();
    assert_eq!(registered.port, port2);

    // And application bytes flow both ways through the overlay.
    n2.send_message(NodeId::new(1), Bytes::from_static(b"over tcp"))
        .await
        .unwrap();
    let payload = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Event::MessageReceived { payload, .. } = events_1.recv().await.unwrap() {
                return payload;
            }
        }
    })
    .await
    .expect("no message over tcp");
    assert_eq!(payload, Bytes::from_static(b"over tcp"));

    n2.leave().await;
    n1.stop().await;
}
