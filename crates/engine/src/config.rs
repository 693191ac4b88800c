//! Engine configuration

use std::time::Duration;

/// Default listen port for a node.
pub const DEFAULT_PORT: u16 = 8888;

/// Maximum number of direct peers a node maintains.
pub const MAX_PEERS: usize = 10;

/// Tunables for the overlay engine. Defaults follow the protocol constants.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on the local peer list.
    pub max_peers: usize,
    /// Period of the heartbeat broadcast.
    pub heartbeat_interval: Duration,
    /// An active node unseen for this long accrues a failure.
    pub node_timeout: Duration,
    /// Period of the failure-detection / integrity sweep.
    pub failure_detection_interval: Duration,
    /// Consecutive failures before a node is forced out.
    pub failure_threshold: u32,
    /// Period of the routing-table rebuild.
    pub routing_refresh_interval: Duration,
    /// A pending reliable message older than this is retransmitted.
    pub retry_timeout: Duration,
    /// Total transmissions per reliable message before it fails.
    pub max_retries: u32,
    /// Acknowledged reliable entries older than this are evicted.
    pub reliable_ttl: Duration,
    /// Period of the reliable-table cleanup sweep.
    pub reliable_cleanup_interval: Duration,
    /// Flood dedup entries older than this are evicted.
    pub dedup_ttl: Duration,
    /// Default hop budget for flooded messages.
    pub flood_max_hops: u8,
    /// Chunk size for the data-exchange layer.
    pub chunk_size: usize,
    /// Terminal transfers older than this are evicted.
    pub transfer_ttl: Duration,
    /// Period of the transfer cleanup sweep.
    pub transfer_cleanup_interval: Duration,
    /// Period of the peer re-discovery sweep.
    pub discovery_interval: Duration,
    /// Discovered entries unseen for this long are pruned.
    pub discovery_stale_timeout: Duration,
    /// Join requests older than this are rejected as replays.
    pub replay_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_peers: MAX_PEERS,
            heartbeat_interval: Duration::from_secs(30),
            node_timeout: Duration::from_secs(90),
            failure_detection_interval: Duration::from_secs(30),
            failure_threshold: 3,
            routing_refresh_interval: Duration::from_secs(30),
            retry_timeout: Duration::from_secs(30),
            max_retries: 3,
            reliable_ttl: Duration::from_secs(300),
            reliable_cleanup_interval: Duration::from_secs(300),
            dedup_ttl: Duration::from_secs(300),
            flood_max_hops: 5,
            chunk_size: 4096,
            transfer_ttl: Duration::from_secs(3600),
            transfer_cleanup_interval: Duration::from_secs(3600),
            discovery_interval: Duration::from_secs(60),
            discovery_stale_timeout: Duration::from_secs(300),
            replay_window: Duration::from_secs(60),
        }
    }
}
