//! Reliable delivery: send-with-ack, bounded retries, delivery accounting

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};
use weave_topology::NodeId;
use weave_transport::{Message, MessageType, Transport};

use crate::event::{Event, EventBus};
use crate::ids::IdSource;
use crate::proto;

/// Delivery state of a tracked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// Sent, not yet acknowledged.
    Pending,
    /// Acknowledged by the destination. Terminal: never reverts.
    Acknowledged,
    /// A transmission aged out and is due for retry.
    Timeout,
    /// The retry budget is exhausted. The entry is evicted immediately.
    Failed,
}

/// One tracked reliable message.
#[derive(Debug, Clone)]
pub struct ReliableMessage {
    /// Tracking id, echoed back in the acknowledgement.
    pub message_id: u64,
    /// Destination peer.
    pub destination: NodeId,
    /// Delivery state.
    pub status: AckStatus,
    /// Transmissions made so far, the initial send included.
    pub attempts: u32,
    /// When the message was first sent.
    pub send_time: Instant,
    /// When the last transmission happened.
    pub last_attempt: Instant,
    message: Message,
}

/// Delivery statistics snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ReliableStats {
    /// Messages handed to the reliable layer.
    pub sent: u64,
    /// Messages acknowledged.
    pub acknowledged: u64,
    /// Messages that exhausted their retry budget.
    pub failed: u64,
}

impl ReliableStats {
    /// Acknowledged share of sent messages, as a percentage.
    pub fn delivery_rate(&self) -> f64 {
        self.acknowledged as f64 / (self.sent.max(1)) as f64 * 100.0
    }
}

/// Send-with-ack layer over a transport.
///
/// Every send allocates a tracking id which travels as the first eight
/// bytes of the data payload; the receiver echoes it in a `MessageAck`.
pub struct ReliableMessaging<T: Transport> {
    local_id: NodeId,
    transport: Arc<T>,
    ids: Arc<dyn IdSource>,
    events: EventBus,
    pending: Mutex<HashMap<u64, ReliableMessage>>,
    sent: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
}

impl<T: Transport> ReliableMessaging<T> {
    /// Wire up the reliable layer.
    pub fn new(
        local_id: NodeId,
        transport: Arc<T>,
        ids: Arc<dyn IdSource>,
        events: EventBus,
    ) -> Self {
        Self {
            local_id,
            transport,
            ids,
            events,
            pending: Mutex::new(HashMap::new()),
            sent: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Send `data` to a direct peer with acknowledgement tracking.
    ///
    /// Returns the tracking id. A transmission failure spends the first
    /// attempt rather than failing the message; the retry sweep takes it
    /// from there.
    pub async fn send(&self, destination: NodeId, data: Bytes) -> u64 {
        let message_id = self.ids.next_id();
        let message = Message::new(
            MessageType::DataMessage,
            self.local_id,
            destination,
            proto::encode_data(message_id, &data),
        );

        let now = Instant::now();
        self.pending.lock().unwrap().insert(
            message_id,
            ReliableMessage {
                message_id,
                destination,
                status: AckStatus::Pending,
                attempts: 1,
                send_time: now,
                last_attempt: now,
                message: message.clone(),
            },
        );
        self.sent.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.transport.send_to_peer(destination, &message).await {
            debug!("initial transmission of message {message_id} failed: {e}");
        }
        message_id
    }

    /// Record an acknowledgement. Idempotent; an acknowledged entry never
    /// reverts and late duplicates are ignored.
    pub fn acknowledge(&self, message_id: u64, from: NodeId) -> bool {
        let delivered = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get_mut(&message_id) {
                Some(entry) if entry.status != AckStatus::Acknowledged => {
                    entry.status = AckStatus::Acknowledged;
                    true
                }
                _ => false,
            }
        };

        if delivered {
            self.acknowledged.fetch_add(1, Ordering::Relaxed);
            self.events.emit(Event::MessageDelivered {
                message_id,
                peer: from,
            });
        }
        delivered
    }

    /// One retry sweep: retransmit every pending entry whose last attempt
    /// is older than `timeout` while it has budget left; fail and evict
    /// the rest. Idempotent under re-invocation.
    pub async fn retry_pending(&self, timeout: Duration, max_retries: u32) {
        let mut to_resend = Vec::new();
        let mut failed = Vec::new();

        {
            let mut pending = self.pending.lock().unwrap();
            let mut exhausted = Vec::new();
            for entry in pending.values_mut() {
                if entry.status != AckStatus::Pending
                    || entry.last_attempt.elapsed() < timeout
                {
                    continue;
                }
                if entry.attempts < max_retries {
                    entry.attempts += 1;
                    entry.last_attempt = Instant::now();
                    to_resend.push((entry.message_id, entry.message.clone()));
                } else {
                    exhausted.push(entry.message_id);
                }
            }
            for id in exhausted {
                if let Some(entry) = pending.remove(&id) {
                    failed.push((entry.message_id, entry.destination));
                }
            }
        }

        for (message_id, message) in to_resend {
            debug!("retransmitting message {message_id}");
            if let Err(e) = self
                .transport
                .send_to_peer(message.receiver, &message)
                .await
            {
                debug!("retransmission of message {message_id} failed: {e}");
            }
        }

        for (message_id, peer) in failed {
            warn!("message {message_id} to {peer} exhausted its retry budget");
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.events.emit(Event::MessageFailed { message_id, peer });
        }
    }

    /// Evict acknowledged entries older than `ttl` so late duplicate acks
    /// cannot resurrect them.
    pub fn cleanup(&self, ttl: Duration) {
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|_, entry| {
            entry.status != AckStatus::Acknowledged || entry.send_time.elapsed() <= ttl
        });
    }

    /// Delivery state of a tracked message, `None` once evicted.
    pub fn status_of(&self, message_id: u64) -> Option<AckStatus> {
        self.pending
            .lock()
            .unwrap()
            .get(&message_id)
            .map(|entry| entry.status)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ReliableStats {
        ReliableStats {
            sent: self.sent.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
