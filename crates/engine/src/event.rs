//! Engine event stream
//!
//! One tagged event stream replaces per-event callback slots: consumers
//! subscribe, the engine emits. Events are emitted with no engine lock held
//! and a lagging subscriber only loses its own backlog.

use bytes::Bytes;
use tokio::sync::broadcast;
use weave_topology::{NodeAddress, NodeId};

/// Everything the engine reports to its host.
#[derive(Debug, Clone)]
pub enum Event {
    /// A node joined the registry and became active.
    NodeAdded {
        /// The new node.
        id: NodeId,
        /// Where it listens.
        address: NodeAddress,
    },
    /// A node left gracefully and was purged.
    NodeRemoved {
        /// The departed node.
        id: NodeId,
    },
    /// A node was forced out after repeated failures.
    NodeFailed {
        /// The failed node.
        id: NodeId,
    },
    /// Connectivity was restored after a removal.
    NetworkRepaired,
    /// A data message addressed to this node arrived.
    MessageReceived {
        /// Originating node.
        from: NodeId,
        /// Application bytes.
        payload: Bytes,
    },
    /// A chunked transfer completed reassembly.
    DataReceived {
        /// Originating node.
        from: NodeId,
        /// The reassembled bytes.
        data: Bytes,
        /// Application-chosen type tag.
        data_type: String,
    },
    /// An outgoing or incoming transfer reached a terminal state.
    TransferComplete {
        /// The transfer.
        transfer_id: u64,
        /// Whether it completed rather than failed.
        success: bool,
    },
    /// A chunk was sent or received.
    TransferProgress {
        /// The transfer.
        transfer_id: u64,
        /// Bytes moved so far.
        transferred: u64,
        /// Total bytes, when known.
        total: u64,
    },
    /// A reliable message was acknowledged.
    MessageDelivered {
        /// The acknowledged message.
        message_id: u64,
        /// The acknowledging peer.
        peer: NodeId,
    },
    /// A reliable message exhausted its retry budget.
    MessageFailed {
        /// The failed message.
        message_id: u64,
        /// The unresponsive destination.
        peer: NodeId,
    },
    /// Discovery learned about a node.
    PeerDiscovered {
        /// The discovered node.
        id: NodeId,
        /// Where it listens.
        address: NodeAddress,
    },
    /// A bootstrap address could not be reached.
    DiscoveryFailed {
        /// The unreachable address.
        address: NodeAddress,
    },
    /// This node's registration was accepted.
    RegistrationSucceeded {
        /// The accepting responder.
        responder: NodeId,
    },
    /// This node's registration failed or was rejected.
    RegistrationFailed {
        /// Why.
        reason: String,
    },
}

/// Broadcast fan-out of engine events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event. Best-effort: having no subscribers is not an error.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
