//! Shared unit-test fixtures: a recording stub transport and pre-wired
//! component bundles.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashSet;
use weave_topology::{NodeAddress, NodeId, TopologyGraph};
use weave_transport::{
    BroadcastReport, ConnectionId, Inbound, Message, Transport, TransportError,
};

use crate::config::EngineConfig;
use crate::discovery::Discovery;
use crate::event::EventBus;
use crate::membership::Membership;
use crate::peers::PeerTable;
use crate::registration::Registration;
use crate::router::RouteCache;

/// A transport that records instead of sending. Sends to "connected"
/// peers succeed silently (and are captured), everything else observes
/// `NotConnected`.
pub(crate) struct StubTransport {
    connected: DashSet<NodeId>,
    sent: Mutex<Vec<(NodeId, Message)>>,
    sent_on: Mutex<Vec<(ConnectionId, Message)>>,
    fail_connect: AtomicBool,
    next_conn: AtomicU64,
    incoming_tx: flume::Sender<Inbound>,
    incoming_rx: flume::Receiver<Inbound>,
}

impl StubTransport {
    pub(crate) fn new() -> Self {
        let (incoming_tx, incoming_rx) = flume::unbounded();
        Self {
            connected: DashSet::new(),
            sent: Mutex::new(Vec::new()),
            sent_on: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
            next_conn: AtomicU64::new(1),
            incoming_tx,
            incoming_rx,
        }
    }

    /// Pretend a bound connection to `peer` exists.
    pub(crate) fn mark_connected(&self, peer: NodeId) {
        self.connected.insert(peer);
    }

    /// Make future `connect` calls fail.
    pub(crate) fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Release);
    }

    /// Everything sent by peer id, in order.
    pub(crate) fn sent(&self) -> Vec<(NodeId, Message)> {
        self.sent.lock().unwrap().clone()
    }

    /// Everything sent on raw connections, in order.
    pub(crate) fn sent_on_connections(&self) -> Vec<(ConnectionId, Message)> {
        self.sent_on.lock().unwrap().clone()
    }

    /// Inject an inbound message, as though a peer had sent it.
    #[allow(dead_code)]
    pub(crate) fn inject(&self, connection: ConnectionId, message: Message) {
        let _ = self.incoming_tx.send(Inbound {
            connection,
            message,
        });
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn start(&self) -> Result<NodeAddress, TransportError> {
        Ok(NodeAddress::new("127.0.0.1", 9000))
    }

    async fn connect(&self, addr: &NodeAddress) -> Result<ConnectionId, TransportError> {
        if self.fail_connect.load(Ordering::Acquire) {
            return Err(TransportError::Connect {
                addr: addr.clone(),
                reason: "stubbed failure".to_string(),
            });
        }
        Ok(self.next_conn.fetch_add(1, Ordering::AcqRel))
    }

    fn bind_peer(&self, _connection: ConnectionId, peer: NodeId) -> bool {
        self.connected.insert(peer);
        true
    }

    async fn send_on(
        &self,
        connection: ConnectionId,
        message: &Message,
    ) -> Result<(), TransportError> {
        self.sent_on.lock().unwrap().push((connection, message.clone()));
        Ok(())
    }

    async fn send_to_peer(&self, peer: NodeId, message: &Message) -> Result<(), TransportError> {
        if !self.connected.contains(&peer) {
            return Err(TransportError::NotConnected(peer));
        }
        self.sent.lock().unwrap().push((peer, message.clone()));
        Ok(())
    }

    async fn broadcast(&self, message: &Message, exclude: Option<NodeId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for peer in self.connected_peers() {
            if Some(peer) == exclude {
                continue;
            }
            self.sent.lock().unwrap().push((peer, message.clone()));
            report.delivered += 1;
        }
        report
    }

    async fn disconnect(&self, peer: NodeId) -> bool {
        self.connected.remove(&peer).is_some()
    }

    fn remote_host(&self, _connection: ConnectionId) -> Option<String> {
        Some("127.0.0.1".to_string())
    }

    fn is_connected(&self, peer: NodeId) -> bool {
        self.connected.contains(&peer)
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.connected.iter().map(|entry| *entry.key()).collect()
    }

    fn incoming(&self) -> flume::Receiver<Inbound> {
        self.incoming_rx.clone()
    }

    async fn shutdown(&self) {
        self.connected.clear();
    }
}

/// A membership manager over a stub transport, local node pre-registered
/// in the topology.
pub(crate) fn stub_membership(
    local_id: NodeId,
    config: EngineConfig,
) -> (Membership<StubTransport>, Arc<StubTransport>) {
    let transport = Arc::new(StubTransport::new());
    let mut graph = TopologyGraph::new();
    graph
        .add_node(local_id, NodeAddress::new("127.0.0.1", 9000))
        .unwrap();
    let peers = Arc::new(PeerTable::new(config.max_peers));
    let membership = Membership::new(
        local_id,
        config,
        Arc::new(Mutex::new(graph)),
        peers,
        transport.clone(),
        Arc::new(RouteCache::new()),
        EventBus::default(),
    );
    (membership, transport)
}

/// The full handshake bundle over one stub transport.
pub(crate) struct StubComponents {
    pub(crate) transport: Arc<StubTransport>,
    pub(crate) membership: Arc<Membership<StubTransport>>,
    pub(crate) registration: Arc<Registration<StubTransport>>,
}

pub(crate) fn stub_components(local_id: NodeId, config: EngineConfig) -> StubComponents {
    let transport = Arc::new(StubTransport::new());
    let events = EventBus::default();
    let mut graph = TopologyGraph::new();
    graph
        .add_node(local_id, NodeAddress::new("127.0.0.1", 9000))
        .unwrap();
    let topology = Arc::new(Mutex::new(graph));
    let peers = Arc::new(PeerTable::new(config.max_peers));
    let route_cache = Arc::new(RouteCache::new());

    let membership = Arc::new(Membership::new(
        local_id,
        config.clone(),
        topology.clone(),
        peers.clone(),
        transport.clone(),
        route_cache,
        events.clone(),
    ));
    let discovery = Arc::new(Discovery::new(
        local_id,
        config.clone(),
        transport.clone(),
        topology.clone(),
        events.clone(),
    ));
    let registration = Arc::new(Registration::new(
        local_id,
        config,
        transport.clone(),
        topology,
        peers,
        membership.clone(),
        discovery,
        events,
    ));

    StubComponents {
        transport,
        membership,
        registration,
    }
}
