//! In-process transport for deterministic overlay tests
//!
//! A [`MemoryHub`] stands in for the network: transports register their
//! listen address with the hub, and `connect` pairs two unbounded channels
//! instead of opening a socket. Connection semantics (pending identity,
//! auto-bind on first frame, teardown on close) match the TCP transport so
//! engine tests exercise the same code paths without real sockets.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::task::JoinHandle;
use tracing::debug;
use weave_topology::{NodeAddress, NodeId};
use weave_transport::{
    BroadcastReport, ConnectionId, Inbound, Message, Transport, TransportError,
};

/// One direction of an in-memory connection.
struct PipeEnd {
    tx: flume::Sender<Message>,
    rx: flume::Receiver<Message>,
}

/// The shared fake network: listen addresses mapped to accept queues.
#[derive(Default)]
pub struct MemoryHub {
    listeners: DashMap<NodeAddress, flume::Sender<PipeEnd>>,
}

impl MemoryHub {
    /// Create a new hub. Every transport in a test shares one hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// State per live connection.
struct ConnState {
    tx: flume::Sender<Message>,
    peer: std::sync::RwLock<Option<NodeId>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// In-memory transport implementation.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    listen: NodeAddress,
    connections: Arc<DashMap<ConnectionId, Arc<ConnState>>>,
    by_peer: Arc<DashMap<NodeId, ConnectionId>>,
    incoming_tx: flume::Sender<Inbound>,
    incoming_rx: flume::Receiver<Inbound>,
    next_conn_id: Arc<AtomicU64>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    /// Peers whose outbound frames are silently discarded. Lets tests
    /// simulate a link that accepts writes but never delivers.
    blackholes: DashSet<NodeId>,
}

impl MemoryTransport {
    /// Create a transport that will listen on `listen` within `hub`.
    pub fn new(hub: Arc<MemoryHub>, listen: NodeAddress) -> Self {
        let (incoming_tx, incoming_rx) = flume::unbounded();
        Self {
            hub,
            listen,
            connections: Arc::new(DashMap::new()),
            by_peer: Arc::new(DashMap::new()),
            incoming_tx,
            incoming_rx,
            next_conn_id: Arc::new(AtomicU64::new(1)),
            accept_task: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            blackholes: DashSet::new(),
        }
    }

    /// Start or stop discarding outbound frames for `peer`.
    pub fn set_blackhole(&self, peer: NodeId, enabled: bool) {
        if enabled {
            self.blackholes.insert(peer);
        } else {
            self.blackholes.remove(&peer);
        }
    }

    fn remove_conn(&self, conn: ConnectionId) {
        remove(&self.connections, &self.by_peer, conn);
    }
}

/// Register one end of a pipe as a live connection and spawn its reader.
fn install(
    connections: &Arc<DashMap<ConnectionId, Arc<ConnState>>>,
    by_peer: &Arc<DashMap<NodeId, ConnectionId>>,
    incoming: &flume::Sender<Inbound>,
    next_conn_id: &AtomicU64,
    end: PipeEnd,
) -> ConnectionId {
    let conn_id = next_conn_id.fetch_add(1, Ordering::AcqRel);
    let state = Arc::new(ConnState {
        tx: end.tx,
        peer: std::sync::RwLock::new(None),
        reader: std::sync::Mutex::new(None),
    });
    connections.insert(conn_id, state.clone());

    let connections = connections.clone();
    let by_peer = by_peer.clone();
    let incoming = incoming.clone();
    let rx = end.rx;
    let reader = tokio::spawn(async move {
        while let Ok(message) = rx.recv_async().await {
            if !message.sender.is_broadcast() {
                bind(&connections, &by_peer, conn_id, message.sender);
            }
            if incoming
                .send_async(Inbound {
                    connection: conn_id,
                    message,
                })
                .await
                .is_err()
            {
                break;
            }
        }
        remove(&connections, &by_peer, conn_id);
    });
    *state.reader.lock().unwrap() = Some(reader);

    conn_id
}

fn bind(
    connections: &DashMap<ConnectionId, Arc<ConnState>>,
    by_peer: &DashMap<NodeId, ConnectionId>,
    conn: ConnectionId,
    peer: NodeId,
) -> bool {
    if peer.is_broadcast() {
        return false;
    }
    let Some(state) = connections.get(&conn) else {
        return by_peer.contains_key(&peer);
    };
    {
        let bound = state.peer.read().unwrap();
        match *bound {
            Some(existing) if existing == peer => return true,
            Some(_) => return false,
            None => {}
        }
    }
    match by_peer.entry(peer) {
        dashmap::mapref::entry::Entry::Occupied(_) => true,
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            *state.peer.write().unwrap() = Some(peer);
            slot.insert(conn);
            true
        }
    }
}

fn remove(
    connections: &DashMap<ConnectionId, Arc<ConnState>>,
    by_peer: &DashMap<NodeId, ConnectionId>,
    conn: ConnectionId,
) {
    if let Some((_, state)) = connections.remove(&conn) {
        if let Some(peer) = *state.peer.read().unwrap() {
            by_peer.remove_if(&peer, |_, bound| *bound == conn);
        }
        if let Some(task) = state.reader.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> Result<NodeAddress, TransportError> {
        let (accept_tx, accept_rx) = flume::unbounded::<PipeEnd>();
        if self.hub.listeners.contains_key(&self.listen) {
            return Err(TransportError::Bind {
                addr: self.listen.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "address already registered with hub",
                ),
            });
        }
        self.hub.listeners.insert(self.listen.clone(), accept_tx);
        debug!("memory transport listening on {}", self.listen);

        let connections = self.connections.clone();
        let by_peer = self.by_peer.clone();
        let incoming = self.incoming_tx.clone();
        let next_conn_id = self.next_conn_id.clone();
        let task = tokio::spawn(async move {
            while let Ok(end) = accept_rx.recv_async().await {
                install(&connections, &by_peer, &incoming, &next_conn_id, end);
            }
        });
        *self.accept_task.lock().unwrap() = Some(task);

        Ok(self.listen.clone())
    }

    async fn connect(&self, addr: &NodeAddress) -> Result<ConnectionId, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let listener = self
            .hub
            .listeners
            .get(addr)
            .ok_or_else(|| TransportError::Connect {
                addr: addr.clone(),
                reason: "no listener registered".to_string(),
            })?;

        let (out_tx, out_rx) = flume::unbounded();
        let (back_tx, back_rx) = flume::unbounded();
        listener
            .send(PipeEnd {
                tx: back_tx,
                rx: out_rx,
            })
            .map_err(|_| TransportError::Connect {
                addr: addr.clone(),
                reason: "listener is gone".to_string(),
            })?;

        Ok(install(
            &self.connections,
            &self.by_peer,
            &self.incoming_tx,
            &self.next_conn_id,
            PipeEnd {
                tx: out_tx,
                rx: back_rx,
            },
        ))
    }

    fn bind_peer(&self, connection: ConnectionId, peer: NodeId) -> bool {
        bind(&self.connections, &self.by_peer, connection, peer)
    }

    async fn send_on(
        &self,
        connection: ConnectionId,
        message: &Message,
    ) -> Result<(), TransportError> {
        let state = self
            .connections
            .get(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        if state.tx.send(message.clone()).is_err() {
            drop(state);
            self.remove_conn(connection);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn send_to_peer(&self, peer: NodeId, message: &Message) -> Result<(), TransportError> {
        if self.blackholes.contains(&peer) {
            return Ok(());
        }
        let conn = self
            .by_peer
            .get(&peer)
            .map(|entry| *entry.value())
            .ok_or(TransportError::NotConnected(peer))?;
        self.send_on(conn, message)
            .await
            .map_err(|_| TransportError::NotConnected(peer))
    }

    async fn broadcast(&self, message: &Message, exclude: Option<NodeId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for peer in self.connected_peers() {
            if Some(peer) == exclude {
                continue;
            }
            match self.send_to_peer(peer, message).await {
                Ok(()) => report.delivered += 1,
                Err(_) => report.failed.push(peer),
            }
        }
        report
    }

    async fn disconnect(&self, peer: NodeId) -> bool {
        match self.by_peer.get(&peer).map(|e| *e.value()) {
            Some(conn) => {
                self.remove_conn(conn);
                true
            }
            None => false,
        }
    }

    fn remote_host(&self, connection: ConnectionId) -> Option<String> {
        // Hub addresses share one host namespace, so the local listen
        // host stands in for the remote's.
        if self.connections.contains_key(&connection) {
            Some(self.listen.host.clone())
        } else {
            None
        }
    }

    fn is_connected(&self, peer: NodeId) -> bool {
        self.by_peer.contains_key(&peer)
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.by_peer.iter().map(|e| *e.key()).collect()
    }

    fn incoming(&self) -> flume::Receiver<Inbound> {
        self.incoming_rx.clone()
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.hub.listeners.remove(&self.listen);
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let conns: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        for conn in conns {
            self.remove_conn(conn);
        }
    }
}
