//! TCP transport implementation for the weave overlay
//!
//! One listener task accepts inbound connections; every connection gets a
//! reader task (frame decode, identity auto-bind, handoff to the incoming
//! channel) and a writer task draining a per-connection queue, so a stalled
//! peer never blocks delivery to another peer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use weave_topology::{NodeAddress, NodeId};
use weave_transport::frame::{self, HEADER_LEN};
use weave_transport::{
    BroadcastReport, ConnectionId, Inbound, Message, Transport, TransportConfig, TransportError,
};

/// TCP-specific configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Generic transport configuration.
    pub transport: TransportConfig,
    /// Local address to bind to.
    pub listen: NodeAddress,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            listen: NodeAddress::new("0.0.0.0", 0),
        }
    }
}

/// State per live connection.
struct ConnState {
    /// Queue drained by the writer task, one encoded frame per entry.
    tx: mpsc::UnboundedSender<Bytes>,
    /// Peer id once the connection has been bound.
    peer: std::sync::RwLock<Option<NodeId>>,
    /// Remote host of the socket.
    remote_host: Option<String>,
    /// Reader task handle, aborted on disconnect.
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Shared connection tables.
struct Registry {
    connections: DashMap<ConnectionId, Arc<ConnState>>,
    by_peer: DashMap<NodeId, ConnectionId>,
    next_conn_id: AtomicU64,
}

impl Registry {
    fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_peer: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Bind `conn` to `peer` unless the peer already has a connection.
    /// Returns whether the peer is reachable afterwards.
    fn bind(&self, conn: ConnectionId, peer: NodeId) -> bool {
        if peer.is_broadcast() {
            return false;
        }
        let Some(state) = self.connections.get(&conn) else {
            return self.by_peer.contains_key(&peer);
        };
        {
            let bound = state.peer.read().unwrap();
            match *bound {
                Some(existing) if existing == peer => return true,
                Some(_) => return false,
                None => {}
            }
        }
        match self.by_peer.entry(peer) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Both sides dialed each other; the existing binding wins
                // and this connection stays unbound but readable.
                true
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                *state.peer.write().unwrap() = Some(peer);
                slot.insert(conn);
                debug!("bound connection {conn} to peer {peer}");
                true
            }
        }
    }

    /// Drop a connection and, if it carried the peer binding, the binding.
    fn remove(&self, conn: ConnectionId) {
        if let Some((_, state)) = self.connections.remove(&conn) {
            if let Some(peer) = *state.peer.read().unwrap() {
                self.by_peer.remove_if(&peer, |_, bound| *bound == conn);
            }
            if let Some(task) = state.reader.lock().unwrap().take() {
                task.abort();
            }
        }
    }

    /// Install a freshly accepted or dialed stream: allocate an id, spawn
    /// the reader/writer pair, register the connection.
    fn install(
        self: &Arc<Self>,
        stream: TcpStream,
        incoming: flume::Sender<Inbound>,
        max_payload: usize,
    ) -> ConnectionId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::AcqRel);
        let remote_host = stream.peer_addr().ok().map(|addr| addr.ip().to_string());
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let state = Arc::new(ConnState {
            tx,
            peer: std::sync::RwLock::new(None),
            remote_host,
            reader: std::sync::Mutex::new(None),
        });
        self.connections.insert(conn_id, state.clone());

        tokio::spawn(write_loop(conn_id, write_half, rx, self.clone()));
        let reader = tokio::spawn(read_loop(
            conn_id,
            read_half,
            self.clone(),
            incoming,
            max_payload,
        ));
        *state.reader.lock().unwrap() = Some(reader);

        conn_id
    }
}

/// TCP transport implementation.
pub struct TcpTransport {
    config: TcpConfig,
    registry: Arc<Registry>,
    incoming_tx: flume::Sender<Inbound>,
    incoming_rx: flume::Receiver<Inbound>,
    shutdown_tx: broadcast::Sender<()>,
    listener_handle: RwLock<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Create a new TCP transport. Call [`Transport::start`] to listen.
    pub fn new(config: TcpConfig) -> Self {
        let (incoming_tx, incoming_rx) = flume::bounded(1024);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            registry: Arc::new(Registry::new()),
            incoming_tx,
            incoming_rx,
            shutdown_tx,
            listener_handle: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn send_frame(&self, conn: ConnectionId, message: &Message) -> Result<(), TransportError> {
        let state = self
            .registry
            .connections
            .get(&conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        let frame = frame::encode(message)?;
        if state.tx.send(frame).is_err() {
            drop(state);
            self.registry.remove(conn);
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

/// Writer task: drain the queue in order, tear the connection down on the
/// first socket error so FIFO delivery per connection holds.
async fn write_loop(
    conn_id: ConnectionId,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    registry: Arc<Registry>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            warn!("write to connection {conn_id} failed: {e}");
            break;
        }
        if let Err(e) = write_half.flush().await {
            warn!("flush to connection {conn_id} failed: {e}");
            break;
        }
    }
    registry.remove(conn_id);
}

/// Reader task: frame-at-a-time decode, auto-bind on the first frame with a
/// non-zero sender, handoff to the dispatcher channel.
async fn read_loop(
    conn_id: ConnectionId,
    mut read_half: OwnedReadHalf,
    registry: Arc<Registry>,
    incoming: flume::Sender<Inbound>,
    max_payload: usize,
) {
    loop {
        let message = match read_frame(&mut read_half, max_payload).await {
            Ok(message) => message,
            Err(TransportError::Io(e)) => {
                debug!("connection {conn_id} closed: {e}");
                break;
            }
            Err(e) => {
                warn!("dropping connection {conn_id}: {e}");
                break;
            }
        };

        if !message.sender.is_broadcast() {
            registry.bind(conn_id, message.sender);
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
    registry.remove(conn_id);
}

/// Read exactly one frame from the socket.
async fn read_frame(
    read_half: &mut OwnedReadHalf,
    max_payload: usize,
) -> Result<Message, TransportError> {
    let mut header_buf = [0u8; HEADER_LEN];
    read_half.read_exact(&mut header_buf).await?;
    let header = frame::Header::parse(&header_buf)?;

    if header.payload_len as usize > max_payload {
        return Err(TransportError::InvalidFrame(format!(
            "payload of {} bytes exceeds the configured {max_payload} byte limit",
            header.payload_len
        )));
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    read_half.read_exact(&mut payload).await?;

    Ok(Message {
        kind: header.kind,
        sender: header.sender,
        receiver: header.receiver,
        timestamp_ms: header.timestamp_ms,
        payload: Bytes::from(payload),
    })
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> Result<NodeAddress, TransportError> {
        let listen = &self.config.listen;
        let listener = TcpListener::bind((listen.host.as_str(), listen.port))
            .await
            .map_err(|source| TransportError::Bind {
                addr: listen.clone(),
                source,
            })?;
        let local = listener.local_addr().map_err(TransportError::Io)?;
        info!("tcp transport listening on {local}");

        let registry = self.registry.clone();
        let incoming = self.incoming_tx.clone();
        let max_payload = self.config.transport.max_payload_len;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!("accepted connection from {addr}");
                                if let Err(e) = stream.set_nodelay(true) {
                                    debug!("failed to set nodelay for {addr}: {e}");
                                }
                                registry.install(stream, incoming.clone(), max_payload);
                            }
                            Err(e) => {
                                error!("failed to accept connection: {e}");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("tcp listener shutting down");
                        break;
                    }
                }
            }
        });

        *self.listener_handle.write().await = Some(handle);
        Ok(NodeAddress::new(local.ip().to_string(), local.port()))
    }

    async fn connect(&self, addr: &NodeAddress) -> Result<ConnectionId, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let config = &self.config.transport;
        let mut last_error = None;

        for attempt in 1..=config.connect_attempts {
            match timeout(
                config.connect_timeout,
                TcpStream::connect((addr.host.as_str(), addr.port)),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("failed to set nodelay for {addr}: {e}");
                    }
                    let conn_id = self.registry.install(
                        stream,
                        self.incoming_tx.clone(),
                        config.max_payload_len,
                    );
                    debug!("connected to {addr} as connection {conn_id}");
                    return Ok(conn_id);
                }
                Ok(Err(e)) => {
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    last_error = Some(format!("timed out after {:?}", config.connect_timeout));
                }
            }

            if attempt < config.connect_attempts {
                tokio::time::sleep(config.connect_retry_delay).await;
            }
        }

        Err(TransportError::Connect {
            addr: addr.clone(),
            reason: last_error.unwrap_or_else(|| "no attempts made".to_string()),
        })
    }

    fn bind_peer(&self, connection: ConnectionId, peer: NodeId) -> bool {
        self.registry.bind(connection, peer)
    }

    async fn send_on(
        &self,
        connection: ConnectionId,
        message: &Message,
    ) -> Result<(), TransportError> {
        self.send_frame(connection, message)
    }

    async fn send_to_peer(&self, peer: NodeId, message: &Message) -> Result<(), TransportError> {
        let conn = self
            .registry
            .by_peer
            .get(&peer)
            .map(|entry| *entry.value())
            .ok_or(TransportError::NotConnected(peer))?;
        self.send_frame(conn, message)
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
        match self.registry.by_peer.get(&peer).map(|e| *e.value()) {
            Some(conn) => {
                self.registry.remove(conn);
                debug!("disconnected peer {peer}");
                true
            }
            None => false,
        }
    }

    fn remote_host(&self, connection: ConnectionId) -> Option<String> {
        self.registry
            .connections
            .get(&connection)
            .and_then(|state| state.remote_host.clone())
    }

    fn is_connected(&self, peer: NodeId) -> bool {
        self.registry.by_peer.contains_key(&peer)
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.registry.by_peer.iter().map(|e| *e.key()).collect()
    }

    fn incoming(&self) -> flume::Receiver<Inbound> {
        self.incoming_rx.clone()
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.listener_handle.write().await.take() {
            let _ = handle.await;
        }

        let conns: Vec<ConnectionId> = self
            .registry
            .connections
            .iter()
            .map(|e| *e.key())
            .collect();
        for conn in conns {
            self.registry.remove(conn);
        }
    }
}
