//! Transport Service
//!
//! Owns the listener or the outbound dial loop, the per-session reader and
//! writer workers, and the shared inbound queue feeding the dispatch workers.
//!
//! ## Session lifecycle
//! - **Server**: every accepted socket must send a first frame addressed to
//!   this node's uid within the timeout. The session is registered under that
//!   frame's `From`; a first frame other than `identity` marks it short.
//! - **Client**: one session registered under `server_uid`. In long mode it
//!   announces itself with `identity` and is redialled after any unexpected
//!   drop until `close` is called.
//! - Long-mode writers send a heartbeat whenever they have been idle for the
//!   timeout; long-mode server readers drop a peer silent for that long.

use super::dispatch::HandlerTable;
use super::framer::Framer;
use super::registry::SessionRegistry;
use super::session::{Session, SessionReader, SessionWriter};
use super::types::*;

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct RunState {
    mode: Option<Mode>,
    shutdown: CancellationToken,
}

pub struct Transport {
    config: TransportConfig,
    framer: Framer,
    uid: RwLock<NodeId>,
    run: Mutex<RunState>,
    registry: Arc<SessionRegistry>,
    handlers: Arc<HandlerTable>,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        let framer = Framer::new(&config.pack_header).with_max_frame_len(config.max_frame_len);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));

        Arc::new(Self {
            uid: RwLock::new(NodeId::new(config.uid.clone())),
            framer,
            run: Mutex::new(RunState {
                mode: None,
                shutdown: CancellationToken::new(),
            }),
            registry: SessionRegistry::new(),
            handlers: HandlerTable::new(),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            config,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn handlers(&self) -> &Arc<HandlerTable> {
        &self.handlers
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub(crate) fn inbound(&self) -> &tokio::sync::Mutex<mpsc::Receiver<Message>> {
        &self.inbound_rx
    }

    pub fn uid(&self) -> NodeId {
        self.uid.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_uid_if_empty(&self, uid: NodeId) {
        let mut current = self.uid.write().unwrap_or_else(PoisonError::into_inner);
        if current.is_empty() {
            *current = uid;
        }
    }

    pub fn server_uid(&self) -> NodeId {
        NodeId::new(self.config.server_uid.clone())
    }

    /// `None` until `start_server` or `start_client` has been called.
    pub fn mode(&self) -> Option<Mode> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner).mode
    }

    /// Number of usable sessions.
    pub fn count_nodes(&self) -> usize {
        self.registry.count_usable()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown
            .clone()
    }

    fn timeout(&self) -> Duration {
        self.config.timeout(self.mode().unwrap_or(Mode::Server))
    }

    /// Enters `mode` with a fresh shutdown token. Fails while a run is active.
    fn begin(&self, mode: Mode) -> Result<CancellationToken> {
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = run.mode
            && !run.shutdown.is_cancelled()
        {
            return Err(TransportError::InvalidMode(current));
        }
        run.mode = Some(mode);
        run.shutdown = CancellationToken::new();
        Ok(run.shutdown.clone())
    }

    // ============================================================================
    // Server
    // ============================================================================

    /// Binds `addr` (retrying until it succeeds or the transport is closed)
    /// and starts accepting sessions. Returns the bound address.
    pub async fn start_server(self: &Arc<Self>, addr: &str) -> Result<SocketAddr> {
        let shutdown = self.begin(Mode::Server)?;
        self.set_uid_if_empty(self.server_uid());

        let listener = loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => break listener,
                Err(e) => {
                    tracing::warn!("Failed to listen on {}: {}, retrying", addr, e);
                    tokio::select! {
                        () = tokio::time::sleep(self.config.retry_interval()) => {}
                        () = shutdown.cancelled() => {
                            return Err(TransportError::Bind {
                                addr: addr.to_string(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        };

        let local_addr = listener.local_addr()?;
        tracing::info!("Node {} listening on {}", self.uid(), local_addr);

        self.spawn_dispatch_workers();

        let transport = self.clone();
        tokio::spawn(async move {
            transport.accept_loop(listener, shutdown).await;
        });

        Ok(local_addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = shutdown.cancelled() => break,
            };

            match accepted {
                Ok((stream, _)) => {
                    let transport = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        transport.handle_inbound(stream, shutdown).await;
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::select! {
                        () = tokio::time::sleep(self.config.retry_interval()) => {}
                        () = shutdown.cancelled() => break,
                    }
                }
            }
        }

        tracing::info!("Stopped listening on {:?}", listener.local_addr().ok());
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, shutdown: CancellationToken) {
        let (session, mut reader, writer) = match Session::open(
            stream,
            self.config.read_buffer_len,
            self.config.outbound_capacity,
        ) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::debug!("Dropping accepted socket: {}", e);
                return;
            }
        };

        let handshake = tokio::time::timeout(self.timeout(), self.read_first_frames(&session, &mut reader));
        let messages = match handshake.await {
            Ok(Some(messages)) => messages,
            Ok(None) => {
                tracing::warn!("Rejected connection from {}: invalid first frame", session.peer_addr());
                return;
            }
            Err(_) => {
                tracing::warn!("Rejected connection from {}: no frame before timeout", session.peer_addr());
                return;
            }
        };

        let first = &messages[0];
        let own = self.uid();
        if first.to != own {
            tracing::warn!(
                "Rejected connection from {}: addressed to {:?}, this node is {:?}",
                session.peer_addr(),
                first.to.as_str(),
                own.as_str()
            );
            return;
        }

        if shutdown.is_cancelled() {
            return;
        }

        let id = first.from.clone();
        if first.operation != IDENTITY {
            session.mark_short();
        }

        if let Some(previous) = self.registry.insert(id.clone(), session.clone()) {
            previous.close();
        }
        self.registry.activate(&session);

        if !session.is_short() {
            tracing::info!("Client {} ({}) connected", id, session.peer_addr());
        }

        for msg in messages {
            if self.inbound_tx.send(msg).await.is_err() {
                break;
            }
        }

        self.spawn_workers(id, session, reader, writer);
    }

    /// Reads until at least one frame is decoded. `None` if the peer went
    /// away or the first frame is not a message.
    async fn read_first_frames(
        &self,
        session: &Session,
        reader: &mut SessionReader,
    ) -> Option<Vec<Message>> {
        loop {
            let frames = reader.read_frames(&self.framer).await.ok()??;
            if frames.is_empty() {
                continue;
            }

            let mut frames = frames.into_iter();
            let first = frames.next()?;
            let mut first = serde_json::from_slice::<Message>(&first).ok()?;
            if first.from.is_empty() {
                first.from = session.addr_id();
            }

            let mut messages = vec![first];
            messages.extend(frames.filter_map(|frame| self.decode(session, &frame)));
            return Some(messages);
        }
    }

    // ============================================================================
    // Client
    // ============================================================================

    /// Starts dialling `server_addr` in the background.
    ///
    /// In short mode the session carries no heartbeat and is not redialled.
    pub fn start_client(self: &Arc<Self>, server_addr: &str, short: bool) -> Result<()> {
        let shutdown = self.begin(Mode::Client)?;
        self.spawn_dispatch_workers();

        let transport = self.clone();
        let server_addr = server_addr.to_string();
        tokio::spawn(async move {
            transport.dial_loop(server_addr, short, shutdown).await;
        });
        Ok(())
    }

    async fn dial_loop(self: Arc<Self>, server_addr: String, short: bool, shutdown: CancellationToken) {
        let server_uid = self.server_uid();
        if !short {
            tracing::info!("Connecting to server {}", server_addr);
        }

        loop {
            let connected = tokio::select! {
                connected = TcpStream::connect(&server_addr) => connected,
                () = shutdown.cancelled() => return,
            };
            if shutdown.is_cancelled() {
                return;
            }

            let session = match connected.map_err(TransportError::from).and_then(|stream| {
                Session::open(stream, self.config.read_buffer_len, self.config.outbound_capacity)
                    .map_err(TransportError::from)
            }) {
                Ok((session, reader, writer)) => {
                    self.attach_client(&server_uid, session.clone(), reader, writer, short)
                        .await;
                    if !short {
                        tracing::info!("Connected to server {}", server_addr);
                    }
                    session
                }
                Err(e) => {
                    tracing::debug!("Dial {} failed: {}", server_addr, e);
                    tokio::select! {
                        () = tokio::time::sleep(self.config.retry_interval()) => continue,
                        () = shutdown.cancelled() => return,
                    }
                }
            };

            if short {
                return;
            }

            session.closed().await;

            // Explicit closes remove the entry; unexpected drops leave a tombstone.
            if shutdown.is_cancelled() || !self.registry.contains(&server_uid) {
                return;
            }
            tracing::warn!("Lost connection to server {}, reconnecting", server_addr);
        }
    }

    async fn attach_client(
        self: &Arc<Self>,
        server_uid: &NodeId,
        session: Arc<Session>,
        reader: SessionReader,
        writer: SessionWriter,
        short: bool,
    ) {
        self.set_uid_if_empty(NodeId::new(session.local_addr().to_string()));

        if let Some(previous) = self.registry.insert(server_uid.clone(), session.clone()) {
            previous.close();
        }

        if short {
            session.mark_short();
        } else {
            // Queued before activation so it is always the first frame out.
            let identity = Message::new(self.uid(), server_uid.clone(), IDENTITY, "", serde_json::Value::Null);
            session.enqueue(identity).await;
        }
        self.registry.activate(&session);

        self.spawn_workers(server_uid.clone(), session, reader, writer);
    }

    // ============================================================================
    // Session workers
    // ============================================================================

    fn spawn_workers(
        self: &Arc<Self>,
        id: NodeId,
        session: Arc<Session>,
        reader: SessionReader,
        writer: SessionWriter,
    ) {
        let server = self.mode() == Some(Mode::Server);
        let long = !session.is_short();
        let timeout = self.timeout();

        let read_deadline = (server && long).then_some(timeout);
        let heartbeat = long.then_some(timeout);
        let one_shot = server && !long;

        let transport = self.clone();
        let (read_id, read_session) = (id.clone(), session.clone());
        tokio::spawn(async move {
            transport.read_loop(read_id, read_session, reader, read_deadline).await;
        });

        let transport = self.clone();
        tokio::spawn(async move {
            transport.write_loop(id, session, writer, heartbeat, one_shot).await;
        });
    }

    async fn read_loop(
        self: Arc<Self>,
        id: NodeId,
        session: Arc<Session>,
        mut reader: SessionReader,
        deadline: Option<Duration>,
    ) {
        loop {
            let read = async {
                match deadline {
                    Some(deadline) => tokio::time::timeout(deadline, reader.read_frames(&self.framer))
                        .await
                        .unwrap_or_else(|_| {
                            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "read deadline"))
                        }),
                    None => reader.read_frames(&self.framer).await,
                }
            };

            let frames = tokio::select! {
                frames = read => frames,
                () = session.closed() => break,
            };

            match frames {
                Ok(Some(frames)) => {
                    for frame in frames {
                        let Some(msg) = self.decode(&session, &frame) else {
                            continue;
                        };
                        if self.inbound_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Read from {} failed: {}", id, e);
                    break;
                }
            }
        }

        self.teardown(&id, &session);
    }

    async fn write_loop(
        self: Arc<Self>,
        id: NodeId,
        session: Arc<Session>,
        mut writer: SessionWriter,
        heartbeat: Option<Duration>,
        one_shot: bool,
    ) {
        loop {
            let next = match heartbeat {
                Some(interval) => tokio::select! {
                    msg = writer.outbound.recv() => msg,
                    () = tokio::time::sleep(interval) => Some(Message::new(
                        self.uid(),
                        id.clone(),
                        HEARTBEAT,
                        "",
                        serde_json::Value::Null,
                    )),
                    () = session.closed() => break,
                },
                None => tokio::select! {
                    msg = writer.outbound.recv() => msg,
                    () = session.closed() => break,
                },
            };

            let Some(msg) = next else {
                break;
            };

            match self.write_message(&mut writer.half, msg).await {
                Ok(()) => {}
                Err(e @ (TransportError::Encode(_) | TransportError::FrameTooLarge { .. })) => {
                    tracing::warn!("Dropping unencodable message for {}: {}", id, e);
                    continue;
                }
                Err(e) => {
                    tracing::debug!("Write to {} failed: {}", id, e);
                    break;
                }
            }

            if one_shot {
                break;
            }
        }

        let _ = writer.half.shutdown().await;
        self.teardown(&id, &session);
    }

    async fn write_message(&self, half: &mut OwnedWriteHalf, mut msg: Message) -> Result<()> {
        if msg.from.is_empty() {
            msg.from = self.uid();
        }
        let payload = serde_json::to_vec(&msg)?;
        let frame = self.framer.pack(&payload)?;
        half.write_all(&frame).await?;
        Ok(())
    }

    fn decode(&self, session: &Session, frame: &Bytes) -> Option<Message> {
        match serde_json::from_slice::<Message>(frame) {
            Ok(mut msg) => {
                if msg.from.is_empty() {
                    msg.from = session.addr_id();
                }
                Some(msg)
            }
            Err(e) => {
                tracing::debug!("Dropping undecodable frame from {}: {}", session.peer_addr(), e);
                None
            }
        }
    }

    /// Called by both workers on exit. Only the first call logs.
    fn teardown(&self, id: &NodeId, session: &Arc<Session>) {
        let client = self.mode() == Some(Mode::Client);
        let reconnect = client && !self.shutdown_token().is_cancelled();

        session.close();
        if self.registry.remove(id, session, reconnect) && !session.is_short() {
            if client {
                tracing::info!("Disconnected from server {}", session.peer_addr());
            } else {
                tracing::info!("Client {} ({}) disconnected", id, session.peer_addr());
            }
        }
        session.mark_closed();
    }

    // ============================================================================
    // Public operations
    // ============================================================================

    /// Sends `body` as `operation` to `node`, or to a random usable session
    /// when `node` is `None`.
    ///
    /// Blocks until the target has a usable session; there is no timeout.
    pub async fn request(
        &self,
        body: serde_json::Value,
        operation: &str,
        flag: &str,
        node: Option<&NodeId>,
    ) {
        loop {
            let target = match node {
                Some(id) => id.clone(),
                None => self.registry.wait_for_any().await,
            };
            let session = self.registry.wait_for(&target).await;

            let msg = Message::new(self.uid(), target.clone(), operation, flag, body.clone());
            if session.enqueue(msg).await {
                return;
            }
            tracing::debug!("Session {} closed while sending '{}', waiting again", target, operation);
        }
    }

    /// Closes the listed sessions. An empty list closes every session and
    /// stops the listener or dial loop.
    pub fn close(&self, nodes: &[NodeId]) {
        if nodes.is_empty() {
            self.shutdown_token().cancel();
            for (id, session) in self.registry.drain() {
                session.close();
                tracing::debug!("Closed session {}", id);
            }
            return;
        }

        for id in nodes {
            match self.registry.take(id) {
                Some(session) => {
                    session.close();
                    tracing::debug!("Closed session {}", id);
                }
                None => tracing::debug!("{}", TransportError::UnknownNode(id.clone())),
            }
        }
    }
}
