//! Peer discovery: bootstrap entry and periodic refresh

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use weave_topology::{NodeAddress, NodeId, TopologyGraph};
use weave_transport::{ConnectionId, Message, MessageType, Transport};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::event::{Event, EventBus};
use crate::proto::{self, PeerEntry};

/// A node learned through discovery.
#[derive(Debug, Clone)]
struct DiscoveredNode {
    address: NodeAddress,
    last_seen: Instant,
}

/// Finds peers through bootstrap nodes and keeps the discovered set fresh.
pub struct Discovery<T: Transport> {
    local_id: NodeId,
    config: EngineConfig,
    transport: Arc<T>,
    topology: Arc<Mutex<TopologyGraph>>,
    events: EventBus,
    bootstraps: Mutex<Vec<NodeAddress>>,
    discovered: Mutex<HashMap<NodeId, DiscoveredNode>>,
}

impl<T: Transport> Discovery<T> {
    /// Wire up discovery.
    pub fn new(
        local_id: NodeId,
        config: EngineConfig,
        transport: Arc<T>,
        topology: Arc<Mutex<TopologyGraph>>,
        events: EventBus,
    ) -> Self {
        Self {
            local_id,
            config,
            transport,
            topology,
            events,
            bootstraps: Mutex::new(Vec::new()),
            discovered: Mutex::new(HashMap::new()),
        }
    }

    /// Remember a bootstrap address for initial and periodic discovery.
    pub fn add_bootstrap(&self, address: NodeAddress) {
        let mut bootstraps = self.bootstraps.lock().unwrap();
        if !bootstraps.contains(&address) {
            bootstraps.push(address);
        }
    }

    /// The configured bootstrap addresses.
    pub fn bootstrap_addresses(&self) -> Vec<NodeAddress> {
        self.bootstraps.lock().unwrap().clone()
    }

    /// Enter the network: dial bootstrap addresses in order, and ask the
    /// first one that accepts for its peer list. Every failed address
    /// fires a discovery-failed event.
    pub async fn discover(&self) -> Result<ConnectionId> {
        let bootstraps = self.bootstrap_addresses();
        if bootstraps.is_empty() {
            return Err(EngineError::Configuration(
                "no bootstrap nodes configured".to_string(),
            ));
        }

        let mut last_error = None;
        for address in bootstraps {
            match self.transport.connect(&address).await {
                Ok(conn) => {
                    info!("connected to bootstrap {address}");
                    self.request_peers_on(conn).await?;
                    return Ok(conn);
                }
                Err(e) => {
                    warn!("bootstrap {address} unreachable: {e}");
                    self.events.emit(Event::DiscoveryFailed {
                        address: address.clone(),
                    });
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .map(EngineError::Transport)
            .unwrap_or_else(|| EngineError::Configuration("discovery failed".to_string())))
    }

    async fn request_peers_on(&self, conn: ConnectionId) -> Result<()> {
        let request = Message::new(
            MessageType::PeerDiscovery,
            self.local_id,
            NodeId::BROADCAST,
            proto::encode_peer_discovery(self.config.max_peers as i32),
        );
        self.transport.send_on(conn, &request).await?;
        Ok(())
    }

    /// Periodic re-discovery: ask every connected peer for its view, fall
    /// back to the bootstrap list when isolated, then prune stale entries.
    pub async fn refresh(&self) {
        let peers = self.transport.connected_peers();
        if peers.is_empty() {
            if let Err(e) = self.discover().await {
                debug!("periodic discovery found nothing: {e}");
            }
        } else {
            let request = Message::new(
                MessageType::PeerDiscovery,
                self.local_id,
                NodeId::BROADCAST,
                proto::encode_peer_discovery(self.config.max_peers as i32),
            );
            for peer in peers {
                if let Err(e) = self.transport.send_to_peer(peer, &request).await {
                    debug!("peer-list request to {peer} failed: {e}");
                }
            }
        }

        self.prune_stale(self.config.discovery_stale_timeout);
    }

    /// Answer a peer-list request with registry entries the requester
    /// could dial, capped at the smaller of the asked-for and configured
    /// limits.
    pub async fn handle_request(&self, message: &Message, conn: ConnectionId) {
        let asked = match proto::decode_peer_discovery(&message.payload) {
            Ok(n) if n > 0 => n as usize,
            _ => self.config.max_peers,
        };
        let limit = asked.min(self.config.max_peers);

        let peers: Vec<PeerEntry> = {
            let topology = self.topology.lock().unwrap();
            topology
                .node_ids()
                .into_iter()
                .filter(|&id| id != message.sender && id != self.local_id)
                .filter_map(|id| {
                    topology.address_of(id).map(|address| PeerEntry { id, address })
                })
                .filter(|entry| entry.address.is_usable())
                .take(limit)
                .collect()
        };

        let response = Message::new(
            MessageType::JoinResponse,
            self.local_id,
            message.sender,
            proto::encode_join_response(true, &peers),
        );
        if let Err(e) = self.transport.send_on(conn, &response).await {
            debug!("peer-list reply to {} failed: {e}", message.sender);
        }
    }

    /// Record a discovered node. Fires the discovered event on first
    /// sight; re-discovery just refreshes the timestamp.
    pub fn record(&self, id: NodeId, address: NodeAddress) {
        if id == self.local_id || id.is_broadcast() {
            return;
        }
        let newly_seen = {
            let mut discovered = self.discovered.lock().unwrap();
            let previous = discovered.insert(
                id,
                DiscoveredNode {
                    address: address.clone(),
                    last_seen: Instant::now(),
                },
            );
            previous.is_none()
        };
        if newly_seen {
            self.events.emit(Event::PeerDiscovered { id, address });
        }
    }

    /// Drop discovered entries older than `timeout`.
    pub fn prune_stale(&self, timeout: Duration) {
        let mut discovered = self.discovered.lock().unwrap();
        let before = discovered.len();
        discovered.retain(|_, node| node.last_seen.elapsed() <= timeout);
        let pruned = before - discovered.len();
        if pruned > 0 {
            debug!("pruned {pruned} stale discovered node(s)");
        }
    }

    /// Snapshot of the discovered set.
    pub fn discovered_nodes(&self) -> Vec<(NodeId, NodeAddress)> {
        self.discovered
            .lock()
            .unwrap()
            .iter()
            .map(|(&id, node)| (id, node.address.clone()))
            .collect()
    }

    /// Size of the discovered set.
    pub fn discovered_count(&self) -> usize {
        self.discovered.lock().unwrap().len()
    }
}
