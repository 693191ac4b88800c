//! Engine assembly: dispatcher, periodic maintenance, public surface

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use weave_topology::{NodeAddress, NodeId, TopologyGraph};
use weave_transport::{ConnectionId, Inbound, Message, MessageType, Transport};

use crate::config::EngineConfig;
use crate::discovery::Discovery;
use crate::error::Result;
use crate::event::{Event, EventBus};
use crate::exchange::DataExchange;
use crate::ids::{IdSource, RandomIds};
use crate::membership::Membership;
use crate::peers::PeerTable;
use crate::proto;
use crate::registration::Registration;
use crate::reliable::ReliableMessaging;
use crate::router::{Router, RouteCache, RoutingStrategy};

/// The overlay engine: one value owning every sub-component, a dispatcher
/// draining the transport's incoming channel, and a set of periodic
/// maintenance tasks with explicit cancellation.
pub struct OverlayEngine<T: Transport> {
    config: EngineConfig,
    local_id: NodeId,
    local_address: Mutex<Option<NodeAddress>>,
    transport: Arc<T>,
    topology: Arc<Mutex<TopologyGraph>>,
    peers: Arc<PeerTable>,
    membership: Arc<Membership<T>>,
    router: Arc<Router<T>>,
    reliable: Arc<ReliableMessaging<T>>,
    exchange: Arc<DataExchange<T>>,
    discovery: Arc<Discovery<T>>,
    registration: Arc<Registration<T>>,
    events: EventBus,
    shutdown: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<T: Transport> OverlayEngine<T> {
    /// Build an engine with a random node id.
    pub fn new(transport: Arc<T>, config: EngineConfig) -> Self {
        Self::with_ids(transport, config, Arc::new(RandomIds::new()), None)
    }

    /// Build an engine with an injected id source and, optionally, a
    /// fixed node id. Tests use this for determinism.
    pub fn with_ids(
        transport: Arc<T>,
        config: EngineConfig,
        ids: Arc<dyn IdSource>,
        node_id: Option<NodeId>,
    ) -> Self {
        let local_id = node_id.unwrap_or_else(|| NodeId::new(ids.next_id()));
        let events = EventBus::default();
        let topology = Arc::new(Mutex::new(TopologyGraph::new()));
        let peers = Arc::new(PeerTable::new(config.max_peers));
        let route_cache = Arc::new(RouteCache::new());

        let membership = Arc::new(Membership::new(
            local_id,
            config.clone(),
            topology.clone(),
            peers.clone(),
            transport.clone(),
            route_cache.clone(),
            events.clone(),
        ));
        let router = Arc::new(Router::new(
            local_id,
            transport.clone(),
            topology.clone(),
            route_cache,
        ));
        let reliable = Arc::new(ReliableMessaging::new(
            local_id,
            transport.clone(),
            ids.clone(),
            events.clone(),
        ));
        let exchange = Arc::new(DataExchange::new(
            local_id,
            router.clone(),
            ids,
            events.clone(),
            config.chunk_size,
        ));
        let discovery = Arc::new(Discovery::new(
            local_id,
            config.clone(),
            transport.clone(),
            topology.clone(),
            events.clone(),
        ));
        let registration = Arc::new(Registration::new(
            local_id,
            config.clone(),
            transport.clone(),
            topology.clone(),
            peers.clone(),
            membership.clone(),
            discovery.clone(),
            events.clone(),
        ));

        Self {
            config,
            local_id,
            local_address: Mutex::new(None),
            transport,
            topology,
            peers,
            membership,
            router,
            reliable,
            exchange,
            discovery,
            registration,
            events,
            shutdown: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Bind the transport, register the local node in the topology, and
    /// start the dispatcher and maintenance tasks. Returns the bound
    /// listen address.
    pub async fn start(&self) -> Result<NodeAddress> {
        let address = self.transport.start().await?;
        info!("node {} listening on {address}", self.local_id);

        {
            let mut topology = self.topology.lock().unwrap();
            if !topology.contains(self.local_id) {
                topology.add_node(self.local_id, address.clone())?;
            }
        }
        *self.local_address.lock().unwrap() = Some(address.clone());
        self.registration.set_listen_port(address.port);

        self.spawn_dispatcher();
        self.spawn_timers();
        self.started.store(true, Ordering::Release);

        Ok(address)
    }

    fn spawn_dispatcher(&self) {
        let dispatcher = Dispatcher {
            local_id: self.local_id,
            membership: self.membership.clone(),
            router: self.router.clone(),
            reliable: self.reliable.clone(),
            exchange: self.exchange.clone(),
            discovery: self.discovery.clone(),
            registration: self.registration.clone(),
            events: self.events.clone(),
        };
        let incoming = self.transport.incoming();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    inbound = incoming.recv_async() => match inbound {
                        Ok(inbound) => dispatcher.handle(inbound).await,
                        Err(_) => break,
                    },
                    _ = shutdown.notified() => break,
                }
            }
            debug!("dispatcher stopped");
        });
        self.tasks.lock().unwrap().push(handle);
    }

    fn spawn_timers(&self) {
        let config = &self.config;

        let transport = self.transport.clone();
        let local_id = self.local_id;
        self.spawn_periodic(config.heartbeat_interval, move || {
            let transport = transport.clone();
            async move {
                let beat = Message::new(
                    MessageType::Heartbeat,
                    local_id,
                    NodeId::BROADCAST,
                    Bytes::new(),
                );
                let report = transport.broadcast(&beat, None).await;
                if !report.failed.is_empty() {
                    debug!("heartbeat missed {} peer(s)", report.failed.len());
                }
            }
        });

        let membership = self.membership.clone();
        self.spawn_periodic(config.failure_detection_interval, move || {
            let membership = membership.clone();
            async move {
                membership.maintain_integrity().await;
            }
        });

        let router = self.router.clone();
        self.spawn_periodic(config.routing_refresh_interval, move || {
            let router = router.clone();
            async move { router.update_routing_table() }
        });

        let reliable = self.reliable.clone();
        let retry_timeout = config.retry_timeout;
        let max_retries = config.max_retries;
        self.spawn_periodic(retry_timeout, move || {
            let reliable = reliable.clone();
            async move { reliable.retry_pending(retry_timeout, max_retries).await }
        });

        let reliable = self.reliable.clone();
        let reliable_ttl = config.reliable_ttl;
        self.spawn_periodic(config.reliable_cleanup_interval, move || {
            let reliable = reliable.clone();
            async move { reliable.cleanup(reliable_ttl) }
        });

        let router = self.router.clone();
        let dedup_ttl = config.dedup_ttl;
        self.spawn_periodic(dedup_ttl, move || {
            let router = router.clone();
            async move { router.cleanup_seen(dedup_ttl) }
        });

        let exchange = self.exchange.clone();
        let transfer_ttl = config.transfer_ttl;
        self.spawn_periodic(config.transfer_cleanup_interval, move || {
            let exchange = exchange.clone();
            async move { exchange.cleanup(transfer_ttl) }
        });

        let discovery = self.discovery.clone();
        self.spawn_periodic(config.discovery_interval, move || {
            let discovery = discovery.clone();
            async move { discovery.refresh().await }
        });
    }

    fn spawn_periodic<F, Fut>(&self, period: Duration, work: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => work().await,
                    _ = shutdown.notified() => break,
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Enter an existing overlay through a bootstrap address: remember it
    /// for periodic discovery and send the join request.
    pub async fn join(&self, bootstrap: &NodeAddress) -> Result<()> {
        self.discovery.add_bootstrap(bootstrap.clone());
        self.registration.register_with(bootstrap).await
    }

    /// Announce departure to every peer, then stop.
    pub async fn leave(&self) {
        let notice = Message::new(
            MessageType::LeaveNotification,
            self.local_id,
            NodeId::BROADCAST,
            Bytes::new(),
        );
        self.transport.broadcast(&notice, None).await;
        self.stop().await;
    }

    /// Cancel every task and close the transport. In-flight sends observe
    /// a closed transport.
    pub async fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.shutdown.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("engine task did not stop in time");
            }
        }

        self.transport.shutdown().await;
        info!("node {} stopped", self.local_id);
    }

    /// Send a fire-and-forget data message through the overlay.
    pub async fn send_message(&self, to: NodeId, data: Bytes) -> Result<()> {
        let message = Message::new(
            MessageType::DataMessage,
            self.local_id,
            to,
            proto::encode_data(0, &data),
        );
        self.router.route(&message, RoutingStrategy::ShortestPath).await
    }

    /// Send a data message with acknowledgement tracking. Returns the
    /// tracking id.
    pub async fn send_reliable(&self, to: NodeId, data: Bytes) -> u64 {
        self.reliable.send(to, data).await
    }

    /// Send a large payload as a chunked transfer. Returns the transfer
    /// id.
    pub async fn send_data(&self, to: NodeId, data: Bytes, data_type: &str) -> Result<u64> {
        self.exchange.send(to, data, data_type).await
    }

    /// Flood a data message to the whole overlay with a hop budget.
    pub async fn flood_message(&self, data: Bytes, max_hops: u8) -> Result<()> {
        let message = Message::new(
            MessageType::DataMessage,
            self.local_id,
            NodeId::BROADCAST,
            proto::encode_data(0, &data),
        );
        self.router.flood(&message, max_hops).await
    }

    /// Subscribe to the engine's event stream.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// The local node's id.
    pub fn node_id(&self) -> NodeId {
        self.local_id
    }

    /// The bound listen address, once started.
    pub fn local_address(&self) -> Option<NodeAddress> {
        self.local_address.lock().unwrap().clone()
    }

    /// Number of direct peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Shared topology view.
    pub fn topology(&self) -> &Arc<Mutex<TopologyGraph>> {
        &self.topology
    }

    /// Membership manager.
    pub fn membership(&self) -> &Arc<Membership<T>> {
        &self.membership
    }

    /// Message router.
    pub fn router(&self) -> &Arc<Router<T>> {
        &self.router
    }

    /// Reliable delivery layer.
    pub fn reliable(&self) -> &Arc<ReliableMessaging<T>> {
        &self.reliable
    }

    /// Chunked transfer layer.
    pub fn exchange(&self) -> &Arc<DataExchange<T>> {
        &self.exchange
    }

    /// Peer discovery.
    pub fn discovery(&self) -> &Arc<Discovery<T>> {
        &self.discovery
    }

    /// Registration handshake.
    pub fn registration(&self) -> &Arc<Registration<T>> {
        &self.registration
    }

    /// Wait until another task calls [`stop`](Self::stop) or
    /// [`leave`](Self::leave).
    pub async fn stopped(&self) {
        self.shutdown.notified().await;
    }
}

/// Message fan-out from the transport's incoming channel to the engine
/// components. Messages addressed to another node are forwarded; flood
/// envelopes are deduplicated, re-flooded and unwrapped here.
struct Dispatcher<T: Transport> {
    local_id: NodeId,
    membership: Arc<Membership<T>>,
    router: Arc<Router<T>>,
    reliable: Arc<ReliableMessaging<T>>,
    exchange: Arc<DataExchange<T>>,
    discovery: Arc<Discovery<T>>,
    registration: Arc<Registration<T>>,
    events: EventBus,
}

impl<T: Transport> Dispatcher<T> {
    async fn handle(&self, inbound: Inbound) {
        let message = inbound.message;
        match message.kind {
            MessageType::RouteMessage => {
                match self.router.handle_flood(message.sender, &message.payload).await {
                    Ok(Some(inner)) => self.handle_local(inner, inbound.connection).await,
                    Ok(None) => {}
                    Err(e) => debug!("bad flood envelope from {}: {e}", message.sender),
                }
            }
            _ if !message.receiver.is_broadcast() && message.receiver != self.local_id => {
                if let Err(e) = self.router.forward(&message).await {
                    warn!(
                        "dropping message for {}: {e}",
                        message.receiver
                    );
                }
            }
            _ => self.handle_local(message, inbound.connection).await,
        }
    }

    async fn handle_local(&self, message: Message, conn: ConnectionId) {
        // Any frame from a known node counts as liveness evidence.
        self.membership.touch(message.sender);

        match message.kind {
            MessageType::JoinRequest => {
                self.registration.handle_join_request(&message, conn).await;
            }
            MessageType::JoinResponse => {
                if let Err(e) = self.registration.handle_join_response(&message).await {
                    debug!("bad join response from {}: {e}", message.sender);
                }
            }
            MessageType::LeaveNotification => {
                self.membership.remove_graceful(message.sender).await;
            }
            MessageType::Heartbeat => {
                // The touch above is the whole job; no reply, the peer's
                // own timer covers the other direction.
            }
            MessageType::DataMessage => {
                let (message_id, data) = proto::decode_data(&message.payload);
                if message_id != 0 {
                    let ack = Message::new(
                        MessageType::MessageAck,
                        self.local_id,
                        message.sender,
                        proto::encode_ack(message_id),
                    );
                    if let Err(e) = self.router.route(&ack, RoutingStrategy::Direct).await {
                        debug!("could not ack message {message_id}: {e}");
                    }
                }
                self.events.emit(Event::MessageReceived {
                    from: message.sender,
                    payload: data,
                });
            }
            MessageType::TopologyUpdate => match proto::decode_node_list(&message.payload) {
                Ok(ids) => self.membership.handle_topology_update(&ids),
                Err(e) => debug!("bad topology update from {}: {e}", message.sender),
            },
            MessageType::PeerDiscovery => {
                self.discovery.handle_request(&message, conn).await;
            }
            MessageType::RouteMessage => {
                // A flood envelope nested in a flood envelope is not a
                // thing we produce; drop it.
                debug!("nested flood envelope from {}", message.sender);
            }
            MessageType::MessageAck => match proto::decode_ack(&message.payload) {
                Ok(id) => {
                    self.reliable.acknowledge(id, message.sender);
                }
                Err(e) => debug!("bad ack from {}: {e}", message.sender),
            },
            MessageType::DataChunk => match proto::decode_chunk(&message.payload) {
                Ok(chunk) => self.exchange.handle_chunk(chunk, message.sender),
                Err(e) => debug!("bad chunk from {}: {e}", message.sender),
            },
            MessageType::TransferRequest | MessageType::TransferResponse => {
                debug!("ignoring transfer negotiation from {}", message.sender);
            }
        }
    }
}
