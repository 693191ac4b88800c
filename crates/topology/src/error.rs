//! Error types for topology operations

use thiserror::Error;

use crate::NodeId;

/// Topology-related errors
#[derive(Clone, Debug, Error)]
pub enum TopologyError {
    /// A node id is already registered.
    #[error("node {0} is already registered")]
    DuplicateNode(NodeId),

    /// A node id is not in the registry.
    #[error("node {0} is not registered")]
    UnknownNode(NodeId),

    /// An address string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}
