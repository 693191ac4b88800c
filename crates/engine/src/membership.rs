//! Membership management: node states, failure detection, topology repair

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};
use weave_topology::{NodeAddress, NodeId, TopologyGraph};
use weave_transport::{Message, MessageType, Transport};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::event::{Event, EventBus};
use crate::peers::PeerTable;
use crate::proto;
use crate::router::RouteCache;

/// Lifecycle state of a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Added but not yet active.
    Joining,
    /// Registered and responsive.
    Active,
    /// Departing gracefully.
    Leaving,
    /// Exceeded the failure threshold.
    Failed,
    /// Not in the registry.
    Unknown,
}

/// Everything the membership manager tracks about a node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// The node's id.
    pub id: NodeId,
    /// Where it listens.
    pub address: NodeAddress,
    /// Current lifecycle state.
    pub state: NodeState,
    /// When the node was first added.
    pub join_time: SystemTime,
    /// Last time activity from the node was observed.
    pub last_seen: Instant,
    /// Consecutive failure-detection misses.
    pub consecutive_failures: u32,
}

/// The focal state machine of the overlay: holds a [`NodeInfo`] for every
/// known remote node and drives all state transitions.
///
/// The registry lock and the topology lock are never held across transport
/// I/O, and events fire only after locks are released.
pub struct Membership<T: Transport> {
    local_id: NodeId,
    config: EngineConfig,
    registry: Mutex<BTreeMap<NodeId, NodeInfo>>,
    topology: Arc<Mutex<TopologyGraph>>,
    peers: Arc<PeerTable>,
    transport: Arc<T>,
    route_cache: Arc<RouteCache>,
    events: EventBus,
}

impl<T: Transport> Membership<T> {
    /// Wire up the manager.
    pub fn new(
        local_id: NodeId,
        config: EngineConfig,
        topology: Arc<Mutex<TopologyGraph>>,
        peers: Arc<PeerTable>,
        transport: Arc<T>,
        route_cache: Arc<RouteCache>,
        events: EventBus,
    ) -> Self {
        Self {
            local_id,
            config,
            registry: Mutex::new(BTreeMap::new()),
            topology,
            peers,
            transport,
            route_cache,
            events,
        }
    }

    /// Add a node to the registry and topology, then try to take it as a
    /// direct peer if a slot is free.
    ///
    /// Fails validation for a zero id, the local id, an unusable address
    /// or a duplicate; a failed topology insert rolls the registry back so
    /// no partial state remains.
    pub async fn add_node(&self, id: NodeId, address: NodeAddress) -> Result<()> {
        if id.is_broadcast() {
            return Err(EngineError::Validation("node id must be non-zero".to_string()));
        }
        if id == self.local_id {
            return Err(EngineError::Validation("cannot add the local node".to_string()));
        }
        if !address.is_usable() {
            return Err(EngineError::Validation(format!(
                "unusable address {address} for node {id}"
            )));
        }

        {
            let mut registry = self.registry.lock().unwrap();
            if registry.contains_key(&id) {
                return Err(EngineError::Validation(format!(
                    "node {id} is already registered"
                )));
            }
            registry.insert(
                id,
                NodeInfo {
                    id,
                    address: address.clone(),
                    state: NodeState::Joining,
                    join_time: SystemTime::now(),
                    last_seen: Instant::now(),
                    consecutive_failures: 0,
                },
            );
        }

        let inserted = self.topology.lock().unwrap().add_node(id, address.clone());
        if let Err(e) = inserted {
            self.registry.lock().unwrap().remove(&id);
            return Err(e.into());
        }

        if !self.peers.is_full() {
            self.connect_peer(id, &address).await;
        }

        if let Some(info) = self.registry.lock().unwrap().get_mut(&id) {
            info.state = NodeState::Active;
        }
        self.route_cache.clear();

        info!("added node {id} at {address}");
        self.events.emit(Event::NodeAdded { id, address });
        Ok(())
    }

    /// Take `id` as a direct peer: dial it unless the transport already
    /// holds a connection, record it, and add the local edge.
    async fn connect_peer(&self, id: NodeId, address: &NodeAddress) -> bool {
        if self.peers.contains(id) {
            return true;
        }
        if self.peers.is_full() {
            return false;
        }

        if !self.transport.is_connected(id) {
            match self.transport.connect(address).await {
                Ok(conn) => {
                    self.transport.bind_peer(conn, id);
                }
                Err(e) => {
                    warn!("could not connect to node {id} at {address}: {e}");
                    return false;
                }
            }
        }

        self.peers.insert(id, address.clone());
        self.topology.lock().unwrap().add_edge(self.local_id, id);
        debug!("peered with node {id}");
        true
    }

    /// Common removal path: transition, drop the peer link, purge the
    /// registry and topology entries.
    async fn purge(&self, id: NodeId, state: NodeState) -> bool {
        {
            let mut registry = self.registry.lock().unwrap();
            match registry.get_mut(&id) {
                Some(info) => info.state = state,
                None => return false,
            }
        }

        self.peers.remove(id);
        self.transport.disconnect(id).await;
        self.topology.lock().unwrap().remove_node(id);
        self.registry.lock().unwrap().remove(&id);
        self.route_cache.clear();
        true
    }

    /// Remove a node that announced a graceful departure.
    pub async fn remove_graceful(&self, id: NodeId) -> bool {
        if !self.purge(id, NodeState::Leaving).await {
            return false;
        }
        info!("node {id} left gracefully");
        self.events.emit(Event::NodeRemoved { id });
        self.broadcast_change(id).await;
        self.repair_after_removal(id).await;
        true
    }

    /// Force a node out after failure detection gave up on it.
    pub async fn remove_forced(&self, id: NodeId) -> bool {
        if !self.purge(id, NodeState::Failed).await {
            return false;
        }
        warn!("node {id} forcibly removed");
        self.events.emit(Event::NodeFailed { id });
        self.broadcast_change(id).await;
        self.repair_after_removal(id).await;
        true
    }

    /// Tell the peers a node changed.
    async fn broadcast_change(&self, id: NodeId) {
        let update = Message::new(
            MessageType::TopologyUpdate,
            self.local_id,
            NodeId::BROADCAST,
            proto::encode_node_list(&[id]),
        );
        let report = self.transport.broadcast(&update, Some(id)).await;
        if !report.failed.is_empty() {
            debug!("topology update missed {} peer(s)", report.failed.len());
        }
    }

    /// Record activity from a node: refresh last-seen, clear its failure
    /// counter.
    pub fn touch(&self, id: NodeId) {
        if let Some(info) = self.registry.lock().unwrap().get_mut(&id) {
            info.last_seen = Instant::now();
            info.consecutive_failures = 0;
        }
    }

    /// One failure-detection pass: active nodes unseen within `timeout`
    /// accrue a failure, nodes seen inside the window reset to zero, and
    /// any node at the threshold is forced out. Returns the removed ids.
    pub async fn detect_failed(&self, timeout: Duration) -> Vec<NodeId> {
        let mut expired = Vec::new();
        {
            let mut registry = self.registry.lock().unwrap();
            for info in registry.values_mut() {
                if info.state != NodeState::Active {
                    continue;
                }
                if info.last_seen.elapsed() > timeout {
                    info.consecutive_failures += 1;
                    debug!(
                        "node {} missed a liveness window ({} consecutive)",
                        info.id, info.consecutive_failures
                    );
                    if info.consecutive_failures >= self.config.failure_threshold {
                        expired.push(info.id);
                    }
                } else {
                    info.consecutive_failures = 0;
                }
            }
        }

        for &id in &expired {
            self.remove_forced(id).await;
        }
        expired
    }

    /// Validate the topology, repair it if disconnected, run failure
    /// detection, and raise the peer count toward the cap. Returns whether
    /// the topology is connected afterwards.
    pub async fn maintain_integrity(&self) -> bool {
        {
            let mut topology = self.topology.lock().unwrap();
            topology.validate();
            if !topology.is_connected() {
                warn!("topology disconnected, repairing");
                topology.repair();
            }
        }

        self.detect_failed(self.config.node_timeout).await;
        self.ensure_connectivity().await
    }

    /// Try to fill free peer slots from the registry.
    pub async fn ensure_connectivity(&self) -> bool {
        if !self.peers.is_full() {
            let candidates = self.peer_candidates(None);
            for (id, address) in candidates {
                if self.peers.is_full() {
                    break;
                }
                self.connect_peer(id, &address).await;
            }
        }
        self.topology.lock().unwrap().is_connected()
    }

    /// After a removal: repair the graph if it came apart, then dial
    /// replacement peers. Emits [`Event::NetworkRepaired`] when the
    /// topology ends up connected.
    pub async fn repair_after_removal(&self, removed: NodeId) -> bool {
        {
            let mut topology = self.topology.lock().unwrap();
            if !topology.is_connected() {
                info!("repairing topology after removal of node {removed}");
                topology.repair();
            }
        }

        for (id, address) in self.peer_candidates(Some(removed)) {
            if self.peers.is_full() {
                break;
            }
            self.connect_peer(id, &address).await;
        }

        let connected = self.topology.lock().unwrap().is_connected();
        if connected {
            self.events.emit(Event::NetworkRepaired);
        }
        connected
    }

    /// Registry ids we could still peer with, excluding self, an optional
    /// removed node, and existing peers.
    fn peer_candidates(&self, exclude: Option<NodeId>) -> Vec<(NodeId, NodeAddress)> {
        let topology = self.topology.lock().unwrap();
        topology
            .node_ids()
            .into_iter()
            .filter(|&id| id != self.local_id && Some(id) != exclude && !self.peers.contains(id))
            .filter_map(|id| topology.address_of(id).map(|addr| (id, addr)))
            .filter(|(_, addr)| addr.is_usable())
            .collect()
    }

    /// React to a topology-update announcement: drop peer records for ids
    /// we no longer know, then re-validate.
    pub fn handle_topology_update(&self, changed: &[NodeId]) {
        let mut topology = self.topology.lock().unwrap();
        for &id in changed {
            if !topology.contains(id) {
                self.peers.remove(id);
            }
        }
        topology.validate();
        if !topology.is_connected() {
            debug!("topology disconnected after update");
        }
    }

    /// State of a node, [`NodeState::Unknown`] if unregistered.
    pub fn state_of(&self, id: NodeId) -> NodeState {
        self.registry
            .lock()
            .unwrap()
            .get(&id)
            .map(|info| info.state)
            .unwrap_or(NodeState::Unknown)
    }

    /// Snapshot of a node's info.
    pub fn node_info(&self, id: NodeId) -> Option<NodeInfo> {
        self.registry.lock().unwrap().get(&id).cloned()
    }

    /// Ids currently in `state`.
    pub fn nodes_in_state(&self, state: NodeState) -> Vec<NodeId> {
        self.registry
            .lock()
            .unwrap()
            .values()
            .filter(|info| info.state == state)
            .map(|info| info.id)
            .collect()
    }

    /// Number of active nodes.
    pub fn active_count(&self) -> usize {
        self.nodes_in_state(NodeState::Active).len()
    }

    /// Snapshot of every registered node.
    pub fn all_infos(&self) -> Vec<NodeInfo> {
        self.registry.lock().unwrap().values().cloned().collect()
    }

    /// Whether the node is registered.
    pub fn contains(&self, id: NodeId) -> bool {
        self.registry.lock().unwrap().contains_key(&id)
    }
}
