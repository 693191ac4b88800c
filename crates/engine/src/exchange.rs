//! Chunked data transfer over the router

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};
use weave_topology::NodeId;
use weave_transport::{Message, MessageType, Transport};

use crate::error::Result;
use crate::event::{Event, EventBus};
use crate::ids::IdSource;
use crate::proto;
use crate::router::{Router, RoutingStrategy};

/// One fragment of a transfer. Sequence numbers are dense from zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    /// The transfer this fragment belongs to.
    pub transfer_id: u64,
    /// Position of this fragment.
    pub sequence: u32,
    /// Total fragments in the transfer.
    pub total_chunks: u32,
    /// Fragment bytes.
    pub data: Bytes,
    /// Whether this is the final fragment.
    pub is_last: bool,
}

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Created but not yet moving.
    Pending,
    /// Chunks are flowing.
    InProgress,
    /// All bytes arrived or were sent.
    Completed,
    /// A chunk could not be routed.
    Failed,
    /// Cancelled by the sender; in-flight chunks are not recalled.
    Cancelled,
}

impl TransferStatus {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Bookkeeping for one transfer, outgoing or incoming.
#[derive(Debug, Clone)]
pub struct DataTransfer {
    /// The transfer id, shared by all its chunks.
    pub transfer_id: u64,
    /// Sending node.
    pub source: NodeId,
    /// Receiving node.
    pub destination: NodeId,
    /// Application-chosen type tag.
    pub data_type: String,
    /// Total bytes, when known.
    pub total_size: u64,
    /// Bytes moved so far.
    pub transferred_size: u64,
    /// Lifecycle state.
    pub status: TransferStatus,
    /// When the transfer started.
    pub start_time: Instant,
    /// Last chunk activity.
    pub last_update: Instant,
}

/// Transfer statistics snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeStats {
    /// Bytes sent across all outgoing transfers.
    pub sent_bytes: u64,
    /// Bytes received across all incoming transfers.
    pub received_bytes: u64,
    /// Transfers that completed.
    pub completed: u64,
    /// Transfers that failed.
    pub failed: u64,
}

/// Splits large payloads into routed chunks and reassembles them from
/// arbitrary arrival order on the receiving side.
///
/// Per-chunk reliability is not layered on: a missing chunk leaves the
/// incoming transfer in progress until cleanup evicts it.
pub struct DataExchange<T: Transport> {
    local_id: NodeId,
    router: Arc<Router<T>>,
    ids: Arc<dyn IdSource>,
    events: EventBus,
    chunk_size: usize,
    outgoing: Mutex<HashMap<u64, DataTransfer>>,
    incoming: Mutex<HashMap<u64, DataTransfer>>,
    chunks: Mutex<HashMap<u64, BTreeMap<u32, Bytes>>>,
    completed: Mutex<HashMap<u64, Bytes>>,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    completed_count: AtomicU64,
    failed_count: AtomicU64,
}

impl<T: Transport> DataExchange<T> {
    /// Wire up the exchange layer.
    pub fn new(
        local_id: NodeId,
        router: Arc<Router<T>>,
        ids: Arc<dyn IdSource>,
        events: EventBus,
        chunk_size: usize,
    ) -> Self {
        Self {
            local_id,
            router,
            ids,
            events,
            chunk_size: chunk_size.max(1),
            outgoing: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
            chunks: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            sent_bytes: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            completed_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
        }
    }

    /// Send `data` to `target`, split into chunks routed via shortest
    /// path. Returns the transfer id; any chunk failure marks the transfer
    /// failed and surfaces the routing error.
    pub async fn send(&self, target: NodeId, data: Bytes, data_type: &str) -> Result<u64> {
        let transfer_id = self.ids.next_id();
        let total = data.len() as u64;

        self.outgoing.lock().unwrap().insert(
            transfer_id,
            DataTransfer {
                transfer_id,
                source: self.local_id,
                destination: target,
                data_type: data_type.to_string(),
                total_size: total,
                transferred_size: 0,
                status: TransferStatus::InProgress,
                start_time: Instant::now(),
                last_update: Instant::now(),
            },
        );

        for chunk in split_chunks(transfer_id, &data, self.chunk_size) {
            // Cancellation only stops chunks not yet handed to the router.
            if self.outgoing_status(transfer_id) == Some(TransferStatus::Cancelled) {
                info!("transfer {transfer_id} cancelled mid-send");
                return Ok(transfer_id);
            }

            let chunk_len = chunk.data.len() as u64;
            let message = Message::new(
                MessageType::DataChunk,
                self.local_id,
                target,
                proto::encode_chunk(&chunk),
            );
            if let Err(e) = self.router.route(&message, RoutingStrategy::ShortestPath).await {
                warn!("transfer {transfer_id} failed at chunk {}: {e}", chunk.sequence);
                self.finish_outgoing(transfer_id, TransferStatus::Failed);
                return Err(e);
            }

            self.sent_bytes.fetch_add(chunk_len, Ordering::Relaxed);
            let (transferred, total) = {
                let mut outgoing = self.outgoing.lock().unwrap();
                let entry = outgoing.get_mut(&transfer_id);
                match entry {
                    Some(t) => {
                        t.transferred_size += chunk_len;
                        t.last_update = Instant::now();
                        (t.transferred_size, t.total_size)
                    }
                    None => (0, 0),
                }
            };
            self.events.emit(Event::TransferProgress {
                transfer_id,
                transferred,
                total,
            });
        }

        self.finish_outgoing(transfer_id, TransferStatus::Completed);
        Ok(transfer_id)
    }

    fn outgoing_status(&self, transfer_id: u64) -> Option<TransferStatus> {
        self.outgoing
            .lock()
            .unwrap()
            .get(&transfer_id)
            .map(|t| t.status)
    }

    fn finish_outgoing(&self, transfer_id: u64, status: TransferStatus) {
        {
            let mut outgoing = self.outgoing.lock().unwrap();
            if let Some(entry) = outgoing.get_mut(&transfer_id) {
                entry.status = status;
                entry.last_update = Instant::now();
            }
        }
        match status {
            TransferStatus::Completed => {
                self.completed_count.fetch_add(1, Ordering::Relaxed);
            }
            TransferStatus::Failed => {
                self.failed_count.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        self.events.emit(Event::TransferComplete {
            transfer_id,
            success: status == TransferStatus::Completed,
        });
    }

    /// Record one received chunk; duplicates overwrite harmlessly. When
    /// the last distinct sequence arrives, reassemble in order, stash the
    /// bytes, and report the completed transfer.
    pub fn handle_chunk(&self, chunk: DataChunk, source: NodeId) {
        let transfer_id = chunk.transfer_id;
        let chunk_len = chunk.data.len() as u64;
        let total_chunks = chunk.total_chunks;

        let distinct = {
            let mut chunks = self.chunks.lock().unwrap();
            let slots = chunks.entry(transfer_id).or_default();
            slots.insert(chunk.sequence, chunk.data);
            slots.len() as u32
        };

        let (transferred, total) = {
            let mut incoming = self.incoming.lock().unwrap();
            let entry = incoming.entry(transfer_id).or_insert_with(|| DataTransfer {
                transfer_id,
                source,
                destination: self.local_id,
                data_type: "generic".to_string(),
                total_size: 0,
                transferred_size: 0,
                status: TransferStatus::InProgress,
                start_time: Instant::now(),
                last_update: Instant::now(),
            });
            entry.transferred_size += chunk_len;
            entry.last_update = Instant::now();
            if chunk.is_last && entry.total_size < entry.transferred_size {
                // Best estimate until reassembly fixes the exact size.
                entry.total_size = entry.transferred_size;
            }
            (entry.transferred_size, entry.total_size)
        };
        self.received_bytes.fetch_add(chunk_len, Ordering::Relaxed);

        if distinct == total_chunks {
            self.reassemble(transfer_id, total_chunks, source);
        }

        self.events.emit(Event::TransferProgress {
            transfer_id,
            transferred,
            total,
        });
    }

    /// Concatenate the chunks in sequence order and complete the transfer.
    fn reassemble(&self, transfer_id: u64, total_chunks: u32, source: NodeId) {
        let assembled = {
            let mut chunks = self.chunks.lock().unwrap();
            let Some(slots) = chunks.remove(&transfer_id) else {
                return;
            };
            if slots.len() as u32 != total_chunks
                || slots.keys().last() != Some(&(total_chunks - 1))
            {
                // A gap means the count lied; put the slots back and wait.
                chunks.insert(transfer_id, slots);
                return;
            }
            let mut assembled = BytesMut::new();
            for data in slots.values() {
                assembled.extend_from_slice(data);
            }
            assembled.freeze()
        };

        let data_type = {
            let mut incoming = self.incoming.lock().unwrap();
            match incoming.get_mut(&transfer_id) {
                Some(entry) => {
                    entry.status = TransferStatus::Completed;
                    entry.total_size = assembled.len() as u64;
                    entry.transferred_size = assembled.len() as u64;
                    entry.last_update = Instant::now();
                    entry.data_type.clone()
                }
                None => "generic".to_string(),
            }
        };

        self.completed
            .lock()
            .unwrap()
            .insert(transfer_id, assembled.clone());
        self.completed_count.fetch_add(1, Ordering::Relaxed);

        info!(
            "transfer {transfer_id} complete: {} byte(s) from {source}",
            assembled.len()
        );
        self.events.emit(Event::DataReceived {
            from: source,
            data: assembled,
            data_type,
        });
        self.events.emit(Event::TransferComplete {
            transfer_id,
            success: true,
        });
    }

    /// Cancel an outgoing transfer. Chunks already routed are not
    /// recalled; only subsequent sends stop.
    pub fn cancel(&self, transfer_id: u64) -> bool {
        let mut outgoing = self.outgoing.lock().unwrap();
        match outgoing.get_mut(&transfer_id) {
            Some(entry) if !entry.status.is_terminal() => {
                entry.status = TransferStatus::Cancelled;
                entry.last_update = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Reassembled bytes of a completed incoming transfer.
    pub fn received_data(&self, transfer_id: u64) -> Option<Bytes> {
        self.completed.lock().unwrap().get(&transfer_id).cloned()
    }

    /// Whether an incoming transfer has fully reassembled.
    pub fn is_complete(&self, transfer_id: u64) -> bool {
        self.incoming
            .lock()
            .unwrap()
            .get(&transfer_id)
            .map(|t| t.status == TransferStatus::Completed)
            .unwrap_or(false)
    }

    /// All transfers still in progress, outgoing and incoming.
    pub fn active_transfers(&self) -> Vec<DataTransfer> {
        let mut active: Vec<DataTransfer> = self
            .outgoing
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status == TransferStatus::InProgress)
            .cloned()
            .collect();
        active.extend(
            self.incoming
                .lock()
                .unwrap()
                .values()
                .filter(|t| t.status == TransferStatus::InProgress)
                .cloned(),
        );
        active
    }

    /// Bookkeeping for one transfer, either direction.
    pub fn transfer_info(&self, transfer_id: u64) -> Option<DataTransfer> {
        if let Some(entry) = self.outgoing.lock().unwrap().get(&transfer_id) {
            return Some(entry.clone());
        }
        self.incoming.lock().unwrap().get(&transfer_id).cloned()
    }

    /// Evict terminal transfers idle longer than `ttl`, with their chunk
    /// buffers and reassembled bytes.
    pub fn cleanup(&self, ttl: Duration) {
        let mut evicted = Vec::new();
        {
            let mut outgoing = self.outgoing.lock().unwrap();
            outgoing.retain(|&id, entry| {
                let keep = !entry.status.is_terminal() || entry.last_update.elapsed() <= ttl;
                if !keep {
                    evicted.push(id);
                }
                keep
            });
        }
        {
            let mut incoming = self.incoming.lock().unwrap();
            incoming.retain(|&id, entry| {
                let keep = !entry.status.is_terminal() || entry.last_update.elapsed() <= ttl;
                if !keep {
                    evicted.push(id);
                }
                keep
            });
        }
        if !evicted.is_empty() {
            let mut chunks = self.chunks.lock().unwrap();
            let mut completed = self.completed.lock().unwrap();
            for id in &evicted {
                chunks.remove(id);
                completed.remove(id);
            }
            debug!("evicted {} finished transfer(s)", evicted.len());
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ExchangeStats {
        ExchangeStats {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            completed: self.completed_count.load(Ordering::Relaxed),
            failed: self.failed_count.load(Ordering::Relaxed),
        }
    }
}

/// Split `data` into dense chunks of at most `chunk_size` bytes. The final
/// chunk may be shorter and carries the last flag. Empty payloads become a
/// single empty last chunk.
fn split_chunks(transfer_id: u64, data: &Bytes, chunk_size: usize) -> Vec<DataChunk> {
    let total_chunks = (data.len().div_ceil(chunk_size)).max(1) as u32;
    (0..total_chunks)
        .map(|sequence| {
            let start = sequence as usize * chunk_size;
            let end = (start + chunk_size).min(data.len());
            DataChunk {
                transfer_id,
                sequence,
                total_chunks,
                data: data.slice(start..end),
                is_last: sequence == total_chunks - 1,
            }
        })
        .collect()
}
