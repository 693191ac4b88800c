//! Error types for transports

use thiserror::Error;
use weave_topology::{NodeAddress, NodeId};

use crate::ConnectionId;

/// Errors surfaced by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listen port could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: NodeAddress,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An outbound connection was refused or timed out.
    #[error("failed to connect to {addr}: {reason}")]
    Connect {
        /// The dialed address.
        addr: NodeAddress,
        /// What went wrong.
        reason: String,
    },

    /// A socket read or write failed; the connection is torn down.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// No bound connection to the peer exists.
    #[error("not connected to peer {0}")]
    NotConnected(NodeId),

    /// The pending connection handle is gone.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// A frame failed to decode; the connection is closed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The transport has been shut down.
    #[error("transport is closed")]
    Closed,
}
