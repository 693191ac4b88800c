//! Slot-capped local peer table

use std::collections::BTreeMap;
use std::sync::Mutex;

use weave_topology::{NodeAddress, NodeId};

/// The node's direct peers. Never grows past its capacity.
#[derive(Debug)]
pub struct PeerTable {
    capacity: usize,
    peers: Mutex<BTreeMap<NodeId, NodeAddress>>,
}

impl PeerTable {
    /// Create a table holding at most `capacity` peers.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            peers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a peer. Returns false when the peer is already present or
    /// the table is full.
    pub fn insert(&self, id: NodeId, address: NodeAddress) -> bool {
        let mut peers = self.peers.lock().unwrap();
        if peers.len() >= self.capacity || peers.contains_key(&id) {
            return false;
        }
        peers.insert(id, address);
        true
    }

    /// Drop a peer. Returns whether it was present.
    pub fn remove(&self, id: NodeId) -> bool {
        self.peers.lock().unwrap().remove(&id).is_some()
    }

    /// Whether the peer is recorded.
    pub fn contains(&self, id: NodeId) -> bool {
        self.peers.lock().unwrap().contains_key(&id)
    }

    /// Recorded address of a peer.
    pub fn address_of(&self, id: NodeId) -> Option<NodeAddress> {
        self.peers.lock().unwrap().get(&id).cloned()
    }

    /// All peer ids in ascending order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.peers.lock().unwrap().keys().copied().collect()
    }

    /// Number of recorded peers.
    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().unwrap().is_empty()
    }

    /// Whether every slot is taken.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// The configured slot count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
