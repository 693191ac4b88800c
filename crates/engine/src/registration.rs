//! Join handshake: requester and responder sides

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use weave_topology::{NodeAddress, NodeId, TopologyGraph};
use weave_transport::{now_ms, ConnectionId, Message, MessageType, Transport};

use crate::config::EngineConfig;
use crate::discovery::Discovery;
use crate::error::{EngineError, Result};
use crate::event::{Event, EventBus};
use crate::membership::Membership;
use crate::peers::PeerTable;
use crate::proto::{self, PeerEntry};

/// Where this node stands with the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// No join attempted, or one is in flight.
    Pending,
    /// A responder accepted us.
    Registered,
    /// A responder turned us down.
    Rejected,
    /// The join attempt itself failed.
    Failed,
}

/// Authorization hook consulted before accepting a join request.
pub type AuthorizationCallback = Box<dyn Fn(NodeId, &NodeAddress) -> bool + Send + Sync>;

/// Runs the join handshake in both directions.
pub struct Registration<T: Transport> {
    local_id: NodeId,
    config: EngineConfig,
    transport: Arc<T>,
    topology: Arc<Mutex<TopologyGraph>>,
    peers: Arc<PeerTable>,
    membership: Arc<Membership<T>>,
    discovery: Arc<Discovery<T>>,
    events: EventBus,
    status: Mutex<RegistrationStatus>,
    listen_port: AtomicU16,
    pending_bootstrap: Mutex<Option<NodeAddress>>,
    authorization: Mutex<Option<AuthorizationCallback>>,
}

impl<T: Transport> Registration<T> {
    /// Wire up the handshake component.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: NodeId,
        config: EngineConfig,
        transport: Arc<T>,
        topology: Arc<Mutex<TopologyGraph>>,
        peers: Arc<PeerTable>,
        membership: Arc<Membership<T>>,
        discovery: Arc<Discovery<T>>,
        events: EventBus,
    ) -> Self {
        Self {
            local_id,
            config,
            transport,
            topology,
            peers,
            membership,
            discovery,
            events,
            status: Mutex::new(RegistrationStatus::Pending),
            listen_port: AtomicU16::new(0),
            pending_bootstrap: Mutex::new(None),
            authorization: Mutex::new(None),
        }
    }

    /// Record the port the local transport actually bound.
    pub fn set_listen_port(&self, port: u16) {
        self.listen_port.store(port, Ordering::Release);
    }

    /// Install the authorization hook. `None` admits everyone.
    pub fn set_authorization_callback(&self, callback: Option<AuthorizationCallback>) {
        *self.authorization.lock().unwrap() = callback;
    }

    /// Current registration status of the local node.
    pub fn status(&self) -> RegistrationStatus {
        *self.status.lock().unwrap()
    }

    /// Ask `bootstrap` to admit us: connect and send a join request
    /// carrying our listen port. The response is handled asynchronously
    /// by the dispatcher.
    pub async fn register_with(&self, bootstrap: &NodeAddress) -> Result<()> {
        *self.status.lock().unwrap() = RegistrationStatus::Pending;
        *self.pending_bootstrap.lock().unwrap() = Some(bootstrap.clone());

        let conn = match self.transport.connect(bootstrap).await {
            Ok(conn) => conn,
            Err(e) => {
                self.fail_registration(format!("bootstrap {bootstrap} unreachable: {e}"));
                return Err(e.into());
            }
        };

        let request = Message::new(
            MessageType::JoinRequest,
            self.local_id,
            NodeId::BROADCAST,
            proto::encode_join_request(self.listen_port.load(Ordering::Acquire)),
        );
        if let Err(e) = self.transport.send_on(conn, &request).await {
            self.fail_registration(format!("join request to {bootstrap} failed: {e}"));
            return Err(e.into());
        }

        info!("join request sent to {bootstrap}");
        Ok(())
    }

    fn fail_registration(&self, reason: String) {
        warn!("{reason}");
        *self.status.lock().unwrap() = RegistrationStatus::Failed;
        self.events.emit(Event::RegistrationFailed { reason });
    }

    /// Responder side: validate a join request and either admit the
    /// requester (topology + peer slot + peer-list reply) or turn it
    /// down with an explicit rejection.
    pub async fn handle_join_request(&self, message: &Message, conn: ConnectionId) {
        let requester = message.sender;

        if let Err(reason) = self.validate_join(message, conn) {
            debug!("rejecting join request from {requester}: {reason}");
            self.respond(conn, requester, false, &[]).await;
            return;
        }

        // Validation established the address as derivable; rebuild it.
        let listen_port = proto::decode_join_request(&message.payload).unwrap_or(0);
        let host = self.transport.remote_host(conn).unwrap_or_default();
        let address = NodeAddress::new(host, listen_port);

        if let Err(e) = self.membership.add_node(requester, address.clone()).await {
            debug!("could not admit {requester}: {e}");
            self.respond(conn, requester, false, &[]).await;
            return;
        }

        let peers: Vec<PeerEntry> = {
            let topology = self.topology.lock().unwrap();
            topology
                .node_ids()
                .into_iter()
                .filter(|&id| id != requester && id != self.local_id)
                .filter_map(|id| {
                    topology.address_of(id).map(|address| PeerEntry { id, address })
                })
                .filter(|entry| entry.address.is_usable())
                .take(self.config.max_peers)
                .collect()
        };

        info!("accepted registration of node {requester} at {address}");
        self.respond(conn, requester, true, &peers).await;
    }

    /// The admission checks, in rejection-reason order.
    fn validate_join(
        &self,
        message: &Message,
        conn: ConnectionId,
    ) -> std::result::Result<(), String> {
        let requester = message.sender;
        if requester.is_broadcast() {
            return Err("zero node id".to_string());
        }
        if requester == self.local_id {
            return Err("self-registration".to_string());
        }

        let listen_port =
            proto::decode_join_request(&message.payload).map_err(|e| e.to_string())?;
        if !(1024..=u16::MAX).contains(&listen_port) {
            return Err(format!("listen port {listen_port} out of range"));
        }

        let host = self.transport.remote_host(conn).unwrap_or_default();
        if host.is_empty() {
            return Err("no remote host for connection".to_string());
        }

        if self.topology.lock().unwrap().contains(requester) {
            return Err("already registered".to_string());
        }

        let age_ms = now_ms().saturating_sub(message.timestamp_ms);
        if age_ms > self.config.replay_window.as_millis() as u64 {
            return Err(format!("request is {age_ms} ms old"));
        }

        if let Some(callback) = self.authorization.lock().unwrap().as_ref() {
            let address = NodeAddress::new(host, listen_port);
            if !callback(requester, &address) {
                return Err(EngineError::AuthorizationDenied(requester).to_string());
            }
        }

        if self.peers.is_full() {
            return Err("peer slots are full".to_string());
        }

        Ok(())
    }

    async fn respond(&self, conn: ConnectionId, requester: NodeId, accepted: bool, peers: &[PeerEntry]) {
        let response = Message::new(
            MessageType::JoinResponse,
            self.local_id,
            requester,
            proto::encode_join_response(accepted, peers),
        );
        if let Err(e) = self.transport.send_on(conn, &response).await {
            warn!("join response to {requester} failed: {e}");
        }
    }

    /// Requester side: handle an acceptance or rejection, then fold the
    /// returned peer list into membership. Already-known ids are skipped
    /// without error, so duplicate responses are harmless.
    pub async fn handle_join_response(&self, message: &Message) -> Result<()> {
        let (accepted, entries) = proto::decode_join_response(&message.payload)?;

        if !accepted {
            let mut status = self.status.lock().unwrap();
            if *status == RegistrationStatus::Pending {
                *status = RegistrationStatus::Rejected;
                drop(status);
                self.events.emit(Event::RegistrationFailed {
                    reason: format!("node {} rejected the join request", message.sender),
                });
            }
            return Ok(());
        }

        let newly_registered = {
            let mut status = self.status.lock().unwrap();
            if *status == RegistrationStatus::Pending {
                *status = RegistrationStatus::Registered;
                true
            } else {
                false
            }
        };

        if newly_registered {
            info!("registered with the network via node {}", message.sender);
            self.events.emit(Event::RegistrationSucceeded {
                responder: message.sender,
            });
            let bootstrap = self.pending_bootstrap.lock().unwrap().take();
            if let Some(address) = bootstrap {
                if let Err(e) = self.membership.add_node(message.sender, address).await {
                    debug!("responder {} already known: {e}", message.sender);
                }
            }
        }

        for entry in entries {
            if entry.id == self.local_id
                || entry.id == message.sender
                || !entry.address.is_usable()
            {
                continue;
            }
            self.discovery.record(entry.id, entry.address.clone());
            if self.membership.contains(entry.id) {
                continue;
            }
            if let Err(e) = self.membership.add_node(entry.id, entry.address).await {
                debug!("could not add discovered node {}: {e}", entry.id);
            }
        }

        Ok(())
    }
}
