//! Overlay topology for the weave network
//!
//! This crate provides:
//! - Node identity types (`NodeId`, `NodeAddress`)
//! - The registry + adjacency graph with path finding and repair

pub mod address;
pub mod error;
pub mod graph;
pub mod node_id;

pub use address::NodeAddress;
pub use error::TopologyError;
pub use graph::TopologyGraph;
pub use node_id::NodeId;
