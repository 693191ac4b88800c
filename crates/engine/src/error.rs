//! Error types for the overlay engine

use thiserror::Error;
use weave_topology::{NodeId, TopologyError};
use weave_transport::TransportError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the overlay engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad startup arguments or an unusable configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A transport operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A topology operation failed.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// The topology has no path to the destination.
    #[error("no route to node {0}")]
    RouteNotFound(NodeId),

    /// A request or payload failed validation; no state was mutated.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The authorization hook rejected a registration.
    #[error("node {0} is not authorized")]
    AuthorizationDenied(NodeId),
}
