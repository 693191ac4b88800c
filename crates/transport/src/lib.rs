//! Generic transport abstraction for overlay communication
//!
//! This crate provides a transport-agnostic interface for exchanging framed
//! overlay messages. Specific transports (TCP, in-memory) live in separate
//! crates.
//!
//! Transports handle:
//! - Frame encoding and decoding (fixed 32-byte header, see [`frame`])
//! - Connection management keyed by peer [`NodeId`]
//! - Pending connections awaiting identity binding
//! - Per-connection FIFO delivery

pub mod error;
pub mod frame;
pub mod message;

use std::time::Duration;

use async_trait::async_trait;
use weave_topology::{NodeAddress, NodeId};

pub use error::TransportError;
pub use message::{now_ms, Message, MessageType};

/// Handle for a connection whose peer id is not yet known.
///
/// Outbound connections start pending; they join the by-peer table once
/// [`Transport::bind_peer`] is called or the first frame with a non-zero
/// sender arrives on them.
pub type ConnectionId = u64;

/// A decoded message handed from a transport to the dispatcher.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// The connection the frame arrived on.
    pub connection: ConnectionId,
    /// The decoded message.
    pub message: Message,
}

/// Outcome of a best-effort fan-out.
#[derive(Debug, Clone, Default)]
pub struct BroadcastReport {
    /// Peers the message was handed to.
    pub delivered: usize,
    /// Peers whose send failed; the fan-out does not abort on failure.
    pub failed: Vec<NodeId>,
}

/// Configuration shared by transport implementations.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout for an outbound connection attempt.
    pub connect_timeout: Duration,
    /// Attempts per outbound connect before giving up.
    pub connect_attempts: usize,
    /// Delay between connect attempts.
    pub connect_retry_delay: Duration,
    /// Maximum accepted payload length; larger frames fail decode and the
    /// connection is closed.
    pub max_payload_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(500),
            max_payload_len: frame::MAX_PAYLOAD_LEN,
        }
    }
}

/// Transport trait for sending and receiving framed overlay messages.
///
/// Implementations key established connections by peer [`NodeId`]; before
/// identity is known a connection is addressed by its [`ConnectionId`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bind and start accepting inbound connections.
    ///
    /// Returns the bound listen address. Fails with
    /// [`TransportError::Bind`] if the port is in use.
    async fn start(&self) -> Result<NodeAddress, TransportError>;

    /// Open an outbound connection. The connection is pending identity
    /// assignment until bound to a peer id.
    async fn connect(&self, addr: &NodeAddress) -> Result<ConnectionId, TransportError>;

    /// Key a pending connection by peer id. Returns false if the
    /// connection is gone or already bound to a different peer.
    fn bind_peer(&self, connection: ConnectionId, peer: NodeId) -> bool;

    /// Send on a connection that may still be pending identity.
    async fn send_on(
        &self,
        connection: ConnectionId,
        message: &Message,
    ) -> Result<(), TransportError>;

    /// Send to a bound peer. Fails with [`TransportError::NotConnected`]
    /// if the peer is absent; a socket error tears the connection down so
    /// subsequent sends also observe `NotConnected`.
    async fn send_to_peer(&self, peer: NodeId, message: &Message) -> Result<(), TransportError>;

    /// Fan out to all bound peers except `exclude`. Partial failure is
    /// reported, never aborted on.
    async fn broadcast(&self, message: &Message, exclude: Option<NodeId>) -> BroadcastReport;

    /// Close the connection to a peer. Idempotent; returns whether a
    /// connection existed.
    async fn disconnect(&self, peer: NodeId) -> bool;

    /// Host of the remote end of a connection, when known. Used by the
    /// registration handshake to derive a requester's listen address.
    fn remote_host(&self, connection: ConnectionId) -> Option<String>;

    /// Whether a bound connection to the peer exists.
    fn is_connected(&self, peer: NodeId) -> bool;

    /// Ids of all currently bound peers.
    fn connected_peers(&self) -> Vec<NodeId>;

    /// The single handoff from the transport to the dispatcher: a channel
    /// of decoded inbound messages.
    fn incoming(&self) -> flume::Receiver<Inbound>;

    /// Close all connections and stop the listener. In-flight sends
    /// observe `NotConnected`.
    async fn shutdown(&self);
}
