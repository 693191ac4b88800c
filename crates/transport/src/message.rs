//! Overlay message envelope

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use weave_topology::NodeId;

/// Wire message types. The numeric values are fixed by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Ask a responder to admit the sender to the overlay.
    JoinRequest = 1,
    /// Accept/reject reply carrying a suggested peer list.
    JoinResponse = 2,
    /// Graceful departure announcement.
    LeaveNotification = 3,
    /// Liveness probe; receipt refreshes the sender's last-seen time.
    Heartbeat = 4,
    /// Application data.
    DataMessage = 5,
    /// Changed-node announcement.
    TopologyUpdate = 6,
    /// Peer-list request.
    PeerDiscovery = 7,
    /// Flood envelope carrying a hop-count TTL and an inner frame.
    RouteMessage = 8,
    /// Acknowledgement of a reliable message.
    MessageAck = 9,
    /// One fragment of a chunked transfer.
    DataChunk = 10,
    /// Reserved transfer negotiation request.
    TransferRequest = 11,
    /// Reserved transfer negotiation reply.
    TransferResponse = 12,
}

impl MessageType {
    /// Decode a wire type byte.
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::JoinRequest,
            2 => Self::JoinResponse,
            3 => Self::LeaveNotification,
            4 => Self::Heartbeat,
            5 => Self::DataMessage,
            6 => Self::TopologyUpdate,
            7 => Self::PeerDiscovery,
            8 => Self::RouteMessage,
            9 => Self::MessageAck,
            10 => Self::DataChunk,
            11 => Self::TransferRequest,
            12 => Self::TransferResponse,
            _ => return None,
        })
    }
}

/// A single overlay message.
///
/// `receiver` of [`NodeId::BROADCAST`] addresses every peer. The timestamp
/// is the sender's wall clock in milliseconds; it feeds replay windows and
/// flood dedup keys, never ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type.
    pub kind: MessageType,
    /// Originating node.
    pub sender: NodeId,
    /// Destination node, or broadcast.
    pub receiver: NodeId,
    /// Sender wall clock, milliseconds since the epoch.
    pub timestamp_ms: u64,
    /// Type-specific payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// Build a message stamped with the current wall clock.
    pub fn new(kind: MessageType, sender: NodeId, receiver: NodeId, payload: Bytes) -> Self {
        Self {
            kind,
            sender,
            receiver,
            timestamp_ms: now_ms(),
            payload,
        }
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
