//! Message routing: direct, shortest-path, and bounded flood delivery

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;
use weave_topology::{NodeId, TopologyGraph};
use weave_transport::{Message, MessageType, Transport};

use crate::error::{EngineError, Result};
use crate::proto;

/// How a message should travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// Over the direct link when one exists, otherwise shortest path.
    Direct,
    /// Hop-by-hop along the BFS path; the path is not embedded, every
    /// forwarder repeats the lookup.
    ShortestPath,
    /// To every peer except the immediate sender, bounded by a hop budget
    /// and the dedup table.
    Flood {
        /// Hop budget carried in the envelope.
        max_hops: u8,
    },
}

/// One cached route.
#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
    /// Immediate peer toward the destination.
    pub next_hop: NodeId,
    /// Path length in hops.
    pub hop_count: usize,
    /// When the entry was computed.
    pub built_at: Instant,
}

/// Destination → next-hop cache. Cleared whenever membership changes;
/// lookups fall back to a live topology query on miss.
#[derive(Debug, Default)]
pub struct RouteCache {
    entries: Mutex<HashMap<NodeId, RouteEntry>>,
}

impl RouteCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached route to `dest`.
    pub fn get(&self, dest: NodeId) -> Option<RouteEntry> {
        self.entries.lock().unwrap().get(&dest).copied()
    }

    fn insert(&self, dest: NodeId, entry: RouteEntry) {
        self.entries.lock().unwrap().insert(dest, entry);
    }

    fn replace(&self, entries: HashMap<NodeId, RouteEntry>) {
        *self.entries.lock().unwrap() = entries;
    }

    /// Drop every cached route.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Number of cached routes.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// Routing statistics snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RouterStats {
    /// Messages this node originated or re-routed.
    pub routed: u64,
    /// Messages forwarded on behalf of other nodes.
    pub forwarded: u64,
    /// Mean hops per routed message.
    pub average_hops: f64,
}

/// Routes messages through the overlay.
pub struct Router<T: Transport> {
    local_id: NodeId,
    transport: Arc<T>,
    topology: Arc<Mutex<TopologyGraph>>,
    cache: Arc<RouteCache>,
    seen: DashMap<u64, Instant>,
    routed: AtomicU64,
    forwarded: AtomicU64,
    total_hops: AtomicU64,
}

impl<T: Transport> Router<T> {
    /// Wire up the router.
    pub fn new(
        local_id: NodeId,
        transport: Arc<T>,
        topology: Arc<Mutex<TopologyGraph>>,
        cache: Arc<RouteCache>,
    ) -> Self {
        Self {
            local_id,
            transport,
            topology,
            cache,
            seen: DashMap::new(),
            routed: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            total_hops: AtomicU64::new(0),
        }
    }

    /// Deliver a message with the chosen strategy.
    pub async fn route(&self, message: &Message, strategy: RoutingStrategy) -> Result<()> {
        match strategy {
            RoutingStrategy::Direct => {
                if self.transport.is_connected(message.receiver) {
                    self.transport.send_to_peer(message.receiver, message).await?;
                    self.record_routed(1);
                    Ok(())
                } else {
                    self.route_shortest(message).await
                }
            }
            RoutingStrategy::ShortestPath => self.route_shortest(message).await,
            RoutingStrategy::Flood { max_hops } => self.flood(message, max_hops).await,
        }
    }

    async fn route_shortest(&self, message: &Message) -> Result<()> {
        if message.receiver.is_broadcast() {
            return Err(EngineError::Validation(
                "broadcast messages travel by flood, not shortest path".to_string(),
            ));
        }
        let (hop, hops) = self.next_hop(message.receiver)?;
        self.transport.send_to_peer(hop, message).await?;
        self.record_routed(hops as u64);
        Ok(())
    }

    /// The immediate peer toward `dest` and the expected hop count.
    fn next_hop(&self, dest: NodeId) -> Result<(NodeId, usize)> {
        if self.transport.is_connected(dest) {
            return Ok((dest, 1));
        }
        if let Some(entry) = self.cache.get(dest) {
            return Ok((entry.next_hop, entry.hop_count));
        }

        let path = self.topology.lock().unwrap().find_path(self.local_id, dest);
        if path.len() < 2 {
            return Err(EngineError::RouteNotFound(dest));
        }
        let entry = RouteEntry {
            next_hop: path[1],
            hop_count: path.len() - 1,
            built_at: Instant::now(),
        };
        self.cache.insert(dest, entry);
        Ok((entry.next_hop, entry.hop_count))
    }

    /// Full BFS path from this node to `dest`, shortcut to the direct link
    /// when one exists.
    pub fn find_route(&self, dest: NodeId) -> Vec<NodeId> {
        if self.transport.is_connected(dest) {
            return vec![self.local_id, dest];
        }
        self.topology.lock().unwrap().find_path(self.local_id, dest)
    }

    /// Hops to `dest`, `None` when unreachable.
    pub fn hop_count(&self, dest: NodeId) -> Option<usize> {
        let route = self.find_route(dest);
        if route.is_empty() {
            None
        } else {
            Some(route.len() - 1)
        }
    }

    /// Whether the topology has any path to `dest`.
    pub fn is_reachable(&self, dest: NodeId) -> bool {
        !self.find_route(dest).is_empty()
    }

    /// Originate a flood: record the dedup key, wrap the message in an
    /// envelope carrying the hop budget, fan out to every peer.
    pub async fn flood(&self, message: &Message, max_hops: u8) -> Result<()> {
        if max_hops == 0 {
            return Err(EngineError::Validation("flood needs a hop budget".to_string()));
        }
        self.seen.insert(dedup_key(message), Instant::now());

        let envelope = Message::new(
            MessageType::RouteMessage,
            self.local_id,
            NodeId::BROADCAST,
            proto::encode_flood(max_hops, message)?,
        );
        let report = self.transport.broadcast(&envelope, None).await;
        debug!(
            "flooded message to {} peer(s), {} failed",
            report.delivered,
            report.failed.len()
        );
        self.record_routed(1);
        Ok(())
    }

    /// Process a flood envelope received from `forwarder`.
    ///
    /// Returns the inner message exactly once per dedup key; duplicates
    /// within the dedup window yield `None`. The hop budget is decremented
    /// here and the flood dies once it hits zero.
    pub async fn handle_flood(
        &self,
        forwarder: NodeId,
        payload: &[u8],
    ) -> Result<Option<Message>> {
        let (ttl, inner) = proto::decode_flood(payload)?;
        if self.seen.insert(dedup_key(&inner), Instant::now()).is_some() {
            return Ok(None);
        }

        if ttl > 1 {
            let envelope = Message::new(
                MessageType::RouteMessage,
                self.local_id,
                NodeId::BROADCAST,
                proto::encode_flood(ttl - 1, &inner)?,
            );
            self.transport.broadcast(&envelope, Some(forwarder)).await;
            self.forwarded.fetch_add(1, Ordering::Relaxed);
        }

        Ok(Some(inner))
    }

    /// Forward a message addressed to another node toward its receiver.
    pub async fn forward(&self, message: &Message) -> Result<()> {
        let (hop, _) = self.next_hop(message.receiver)?;
        self.transport.send_to_peer(hop, message).await?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Rebuild the route cache from the current topology.
    pub fn update_routing_table(&self) {
        let topology = self.topology.lock().unwrap();
        let now = Instant::now();
        let mut entries = HashMap::new();
        for dest in topology.node_ids() {
            if dest == self.local_id {
                continue;
            }
            let path = topology.find_path(self.local_id, dest);
            if path.len() >= 2 {
                entries.insert(
                    dest,
                    RouteEntry {
                        next_hop: path[1],
                        hop_count: path.len() - 1,
                        built_at: now,
                    },
                );
            }
        }
        drop(topology);
        self.cache.replace(entries);
        debug!("routing table rebuilt with {} route(s)", self.cache.len());
    }

    /// Evict dedup entries older than `ttl`.
    pub fn cleanup_seen(&self, ttl: Duration) {
        let before = self.seen.len();
        self.seen.retain(|_, stamp| stamp.elapsed() <= ttl);
        let evicted = before.saturating_sub(self.seen.len());
        if evicted > 0 {
            debug!("evicted {evicted} flood dedup entr(ies)");
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> RouterStats {
        let routed = self.routed.load(Ordering::Relaxed);
        let total = self.total_hops.load(Ordering::Relaxed);
        RouterStats {
            routed,
            forwarded: self.forwarded.load(Ordering::Relaxed),
            average_hops: if routed == 0 {
                0.0
            } else {
                total as f64 / routed as f64
            },
        }
    }

    fn record_routed(&self, hops: u64) {
        self.routed.fetch_add(1, Ordering::Relaxed);
        self.total_hops.fetch_add(hops, Ordering::Relaxed);
    }
}

/// Flood dedup key: origin, receiver and send time identify one logical
/// message regardless of which neighbor forwarded it.
fn dedup_key(message: &Message) -> u64 {
    message.sender.raw() ^ message.receiver.raw() ^ message.timestamp_ms
}
