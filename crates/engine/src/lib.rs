//! Overlay network engine for the weave mesh
//!
//! This crate wires the transport, topology and protocol layers into one
//! engine value:
//! - membership and topology maintenance with failure detection and repair
//! - direct / shortest-path / bounded-flood routing
//! - reliable delivery with acknowledgements and bounded retries
//! - chunked data transfer with out-of-order reassembly
//!
//! Hosts construct an [`OverlayEngine`] over a transport, subscribe to its
//! [`Event`] stream, and drive it through the public send/join/leave
//! surface.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod event;
pub mod exchange;
pub mod ids;
pub mod membership;
pub mod peers;
pub mod proto;
pub mod registration;
pub mod reliable;
pub mod router;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{EngineConfig, DEFAULT_PORT, MAX_PEERS};
pub use engine::OverlayEngine;
pub use error::{EngineError, Result};
pub use event::{Event, EventBus};
pub use exchange::{DataChunk, DataTransfer, TransferStatus};
pub use ids::{IdSource, RandomIds, SequenceIds};
pub use membership::{NodeInfo, NodeState};
pub use registration::RegistrationStatus;
pub use reliable::AckStatus;
pub use router::RoutingStrategy;
