//! Engine scenarios over the in-memory transport

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use weave_engine::{
    EngineConfig, Event, OverlayEngine, RegistrationStatus, SequenceIds,
};
use weave_topology::{NodeAddress, NodeId};
use weave_transport_memory::{MemoryHub, MemoryTransport};

fn addr(port: u16) -> NodeAddress {
    NodeAddress::new("mem", port)
}

fn engine_on(
    hub: &Arc<MemoryHub>,
    raw_id: u64,
    port: u16,
    config: EngineConfig,
) -> OverlayEngine<MemoryTransport> {
    let transport = Arc::new(MemoryTransport::new(hub.clone(), addr(port)));
    OverlayEngine::with_ids(
        transport,
        config,
        Arc::new(SequenceIds::starting_at(raw_id * 1_000)),
        Some(NodeId::new(raw_id)),
    )
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn two_node_handshake() {
    let hub = MemoryHub::new();
    let n1 = engine_on(&hub, 1, 9001, EngineConfig::default());
    let n2 = engine_on(&hub, 2, 9002, EngineConfig::default());

    let addr1 = n1.start().await.unwrap();
    n2.start().await.unwrap();

    n2.join(&addr1).await.unwrap();

    wait_until("both topologies hold both nodes", || {
        let t1 = n1.topology().lock().unwrap();
        let t2 = n2.topology().lock().unwrap();
        t1.contains(NodeId::new(2))
            && t2.contains(NodeId::new(1))
            && t1.is_connected()
            && t2.is_connected()
    })
    .await;

    wait_until("both sides peered", || {
        n1.peer_count() == 1 && n2.peer_count() == 1
    })
    .await;

    assert_eq!(n2.registration().status(), RegistrationStatus::Registered);

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
async fn join_is_rejected_at_capacity() {
    let hub = MemoryHub::new();
    let responder_config = EngineConfig {
        max_peers: 1,
        ..EngineConfig::default()
    };
    let n1 = engine_on(&hub, 1, 9001, responder_config);
    let n2 = engine_on(&hub, 2, 9002, EngineConfig::default());
    let n3 = engine_on(&hub, 3, 9003, EngineConfig::default());

    let addr1 = n1.start().await.unwrap();
    n2.start().await.unwrap();
    n3.start().await.unwrap();

    n2.join(&addr1).await.unwrap();
    wait_until("first join accepted", || {
        n2.registration().status() == RegistrationStatus::Registered
    })
    .await;

    n3.join(&addr1).await.unwrap();
    wait_until("second join rejected", || {
        n3.registration().status() == RegistrationStatus::Rejected
    })
    .await;

    // No topology entry was created for the rejected requester.
    assert!(!n1.topology().lock().unwrap().contains(NodeId::new(3)));

    n1.stop().await;
    n2.stop().await;
    n3.stop().await;
}

#[tokio::test]
async fn three_hop_routing_over_a_line() {
    let hub = MemoryHub::new();
    let engines: Vec<_> = (1..=4u64)
        .map(|i| engine_on(&hub, i, 9000 + i as u16, EngineConfig::default()))
        .collect();
    for engine in &engines {
        engine.start().await.unwrap();
    }

    // Adjacent pairs become members and direct peers of each other.
    for i in 0..3usize {
        let left = &engines[i];
        let right = &engines[i + 1];
        left.membership()
            .add_node(right.node_id(), addr(9001 + i as u16 + 1))
            .await
            .unwrap();
        right
            .membership()
            .add_node(left.node_id(), addr(9001 + i as u16))
            .await
            .unwrap();
    }

    // Everyone learns the full line topology, without extra links.
    for engine in &engines {
        let mut topology = engine.topology().lock().unwrap();
        for raw in 1..=4u64 {
            let id = NodeId::new(raw);
            if !topology.contains(id) {
                topology.add_node(id, addr(9000 + raw as u16)).unwrap();
            }
        }
        for pair in [(1u64, 2u64), (2, 3), (3, 4)] {
            topology.add_edge(NodeId::new(pair.0), NodeId::new(pair.1));
        }
    }

    let route = engines[0].router().find_route(NodeId::new(4));
    assert_eq!(
        route,
        vec![NodeId::new(1), NodeId::new(2), NodeId::new(3), NodeId::new(4)]
    );

    let mut events_d = engines[3].events();
    engines[0]
        .send_message(NodeId::new(4), Bytes::from_static(b"across the line"))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Event::MessageReceived { from, payload } = events_d.recv().await.unwrap() {
                return (from, payload);
            }
        }
    })
    .await
    .expect("message never arrived at the far end");
    assert_eq!(event.0, NodeId::new(1));
    assert_eq!(event.1, Bytes::from_static(b"across the line"));

    // Both intermediate nodes observed a forwarding event.
    assert_eq!(engines[1].router().stats().forwarded, 1);
    assert_eq!(engines[2].router().stats().forwarded, 1);

    for engine in &engines {
        engine.stop().await;
    }
}

#[tokio::test]
async fn large_transfer_reassembles() {
    let hub = MemoryHub::new();
    let config = EngineConfig {
        chunk_size: 1024,
        ..EngineConfig::default()
    };
    let n1 = engine_on(&hub, 1, 9001, config.clone());
    let n2 = engine_on(&hub, 2, 9002, config);

    let addr1 = n1.start().await.unwrap();
    n2.start().await.unwrap();
    n2.join(&addr1).await.unwrap();
    wait_until("handshake finished", || {
        n1.peer_count() == 1 && n2.peer_count() == 1
    })
    .await;

    let original = Bytes::from((0..10_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>());
    let mut events = n1.events();

    let transfer_id = n2
        .send_data(NodeId::new(1), original.clone(), "generic")
        .await
        .unwrap();
    assert_ne!(transfer_id, 0);

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Event::DataReceived { from, data, data_type } = events.recv().await.unwrap() {
                return (from, data, data_type);
            }
        }
    })
    .await
    .expect("transfer never completed");

    assert_eq!(received.0, NodeId::new(2));
    assert_eq!(received.1, original);
    assert_eq!(received.2, "generic");
    assert_eq!(n1.exchange().received_data(transfer_id).unwrap(), original);

    let info = n1.exchange().transfer_info(transfer_id).unwrap();
    assert_eq!(info.total_size, 10_000);

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
async fn failure_detection_removes_a_dead_node() {
    let hub = MemoryHub::new();
    let config = EngineConfig {
        heartbeat_interval: Duration::from_millis(100),
        node_timeout: Duration::from_millis(400),
        failure_detection_interval: Duration::from_millis(150),
        failure_threshold: 3,
        ..EngineConfig::default()
    };

    let engines: Vec<_> = (1..=3u64)
        .map(|i| engine_on(&hub, i, 9000 + i as u16, config.clone()))
        .collect();
    for engine in &engines {
        engine.start().await.unwrap();
    }

    // Full mesh.
    for i in 0..engines.len() {
        for j in 0..engines.len() {
            if i != j {
                engines[i]
                    .membership()
                    .add_node(engines[j].node_id(), addr(9001 + j as u16))
                    .await
                    .unwrap();
            }
        }
    }

    let mut events_1 = engines[0].events();
    let mut events_2 = engines[1].events();

    // Kill node 3 without a leave announcement.
    engines[2].stop().await;

    let mut failed_seen = (0, 0);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while failed_seen != (1, 1) && tokio::time::Instant::now() < deadline {
        tokio::select! {
            Ok(event) = events_1.recv() => {
                if matches!(event, Event::NodeFailed { id } if id == NodeId::new(3)) {
                    failed_seen.0 += 1;
                }
            }
            Ok(event) = events_2.recv() => {
                if matches!(event, Event::NodeFailed { id } if id == NodeId::new(3)) {
                    failed_seen.1 += 1;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
    assert_eq!(failed_seen, (1, 1), "each survivor fails the node exactly once");

    for engine in &engines[..2] {
        assert!(!engine.membership().contains(NodeId::new(3)));
        assert!(engine.membership().maintain_integrity().await);
        assert!(engine.topology().lock().unwrap().is_connected());
    }

    engines[0].stop().await;
    engines[1].stop().await;
}

#[tokio::test]
async fn reliable_send_fails_over_a_dead_link() {
    let hub = MemoryHub::new();
    let config = EngineConfig {
        retry_timeout: Duration::from_millis(150),
        max_retries: 3,
        ..EngineConfig::default()
    };
    let n1 = engine_on(&hub, 1, 9001, config.clone());
    let n2 = engine_on(&hub, 2, 9002, config);

    let addr1 = n1.start().await.unwrap();
    n2.start().await.unwrap();
    n2.join(&addr1).await.unwrap();
    wait_until("handshake finished", || n2.peer_count() == 1).await;

    // The link accepts writes but never delivers them.
    let mut events = n2.events();
    n2.transport().set_blackhole(NodeId::new(1), true);

    let message_id = n2
        .send_reliable(NodeId::new(1), Bytes::from_static(b"into the void"))
        .await;

    let failed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Event::MessageFailed { message_id, peer } = events.recv().await.unwrap() {
                return (message_id, peer);
            }
        }
    })
    .await
    .expect("the message never failed");

    assert_eq!(failed.0, message_id);
    assert_eq!(failed.1, NodeId::new(1));
    let stats = n2.reliable().stats();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(n2.reliable().status_of(message_id), None);

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
async fn reliable_send_is_acknowledged_end_to_end() {
    let hub = MemoryHub::new();
    let n1 = engine_on(&hub, 1, 9001, EngineConfig::default());
    let n2 = engine_on(&hub, 2, 9002, EngineConfig::default());

    let addr1 = n1.start().await.unwrap();
    n2.start().await.unwrap();
    n2.join(&addr1).await.unwrap();
    wait_until("handshake finished", || n2.peer_count() == 1).await;

    let mut events = n2.events();
    let message_id = n2
        .send_reliable(NodeId::new(1), Bytes::from_static(b"please confirm"))
        .await;

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Event::MessageDelivered { message_id, peer } = events.recv().await.unwrap() {
                return (message_id, peer);
            }
        }
    })
    .await
    .expect("no delivery confirmation");

    assert_eq!(delivered.0, message_id);
    assert_eq!(delivered.1, NodeId::new(1));
    assert!((n2.reliable().stats().delivery_rate() - 100.0).abs() < f64::EPSILON);

    n1.stop().await;
    n2.stop().await;
}

#[tokio::test]
async fn flood_reaches_everyone_once() {
    let hub = MemoryHub::new();
    let engines: Vec<_> = (1..=3u64)
        .map(|i| engine_on(&hub, i, 9000 + i as u16, EngineConfig::default()))
        .collect();
    for engine in &engines {
        engine.start().await.unwrap();
    }
    for i in 0..engines.len() {
        for j in 0..engines.len() {
            if i != j {
                engines[i]
                    .membership()
                    .add_node(engines[j].node_id(), addr(9001 + j as u16))
                    .await
                    .unwrap();
            }
        }
    }

    let mut events_2 = engines[1].events();
    let mut events_3 = engines[2].events();

    engines[0]
        .flood_message(Bytes::from_static(b"hear ye"), 4)
        .await
        .unwrap();

    // Both peers see the message exactly once despite re-flooding.
    for events in [&mut events_2, &mut events_3] {
        let payload = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Event::MessageReceived { payload, .. } = events.recv().await.unwrap() {
                    return payload;
                }
            }
        })
        .await
        .expect("flood never arrived");
        assert_eq!(payload, Bytes::from_static(b"hear ye"));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    for events in [&mut events_2, &mut events_3] {
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, Event::MessageReceived { .. }),
                "flood delivered twice"
            );
        }
    }

    for engine in &engines {
        engine.stop().await;
    }
}
