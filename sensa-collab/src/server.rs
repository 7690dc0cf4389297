//! Self-hostable realtime relay.
//!
//! ```text
//! WsTransport A ──┐                          ┌── topic session:<uuid>
//!                 ├── RelayServer ── RoomManager ── BroadcastGroup (fan-out, presence)
//! WsTransport B ──┘        ▲                 └── topic session:<uuid>
//!                          │
//!                    ChangeFeed (store writes)
//! ```
//!
//! Each connection may join any number of topics. The relay never looks
//! inside broadcast payloads; it forwards the encoded frame as received.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{Envelope, RoomManager};
use crate::config::RelayConfig;
use crate::model::ClientId;
use crate::protocol::{Frame, FrameKind, ProtocolError};
use crate::store::ChangeFeed;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay-wide counters.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub routed_changes: u64,
}

pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
    feed_routers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    /// Relay with no connections. Nothing is served until
    /// [`serve`](Self::serve) or [`run`](Self::run).
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
            feed_routers: Mutex::new(Vec::new()),
            shutdown: watch::channel(false).0,
        }
    }

    /// Relay on `127.0.0.1:9090`.
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Topics with at least one member.
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Connection and traffic counters since the relay was created.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Route store changes to the topics of their sessions.
    pub fn attach_change_feed(&self, feed: &ChangeFeed) {
        let mut rx = feed.subscribe();
        let rooms = self.rooms.clone();
        let stats = self.stats.clone();
        let router = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        if rooms.route_table_change(&change).await > 0 {
                            stats.write().await.routed_changes += 1;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Relay change router lagged, {skipped} changes dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.feed_routers.lock().push(router);
    }

    /// Stop accepting and close every open connection. Clients see the
    /// socket close and their channels move to `Error`.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            log::info!("Relay shutting down");
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until
    /// [`shutdown`](Self::shutdown). The listener is dropped on return.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            };
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config, shutdown).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let member = ClientId::new();
        log::info!("WebSocket connection {member} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Forwarder tasks push encoded frames here; the loop below writes them.
        let (conn_tx, mut conn_rx) = mpsc::channel::<Arc<Envelope>>(config.broadcast_capacity);
        let mut joined: HashMap<String, JoinHandle<()>> = HashMap::new();

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_frames += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                let frame = match Frame::decode(&data) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Undecodable frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                let replies = Self::handle_frame(
                                    frame, data.to_vec(), member, &rooms, &config, &conn_tx, &mut joined,
                                ).await;
                                for reply in replies {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::debug!("WebSocket error from {addr}: {e}");
                                break;
                            }
                        }
                    }
                    outgoing = conn_rx.recv() => {
                        if let Some(envelope) = outgoing {
                            ws_sender.send(Message::Binary(envelope.bytes.clone().into())).await?;
                        }
                    }
                    _ = shutdown.wait_for(|stop| *stop) => {
                        let _ = ws_sender.close().await;
                        break;
                    }
                }
            }
            Ok(())
        }
        .await;

        // Abrupt or clean, every joined topic sees this member's presences leave.
        for (topic, forwarder) in joined {
            forwarder.abort();
            if let Some(room) = rooms.get(&topic).await {
                room.remove_member(member).await;
            }
            rooms.remove_if_empty(&topic).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection {member} from {addr} closed");
        result
    }

    /// Apply one client frame. Returns the frames to send straight back.
    async fn handle_frame(
        frame: Frame,
        raw: Vec<u8>,
        member: ClientId,
        rooms: &RoomManager,
        config: &RelayConfig,
        conn_tx: &mpsc::Sender<Arc<Envelope>>,
        joined: &mut HashMap<String, JoinHandle<()>>,
    ) -> Vec<Frame> {
        let topic = frame.topic.clone();
        let reference = frame.reference;

        match frame.kind {
            FrameKind::Join => {
                let room = rooms.get_or_create(&topic).await;
                if !joined.contains_key(&topic) {
                    if room.member_count().await >= config.max_members_per_topic {
                        return vec![Frame::error(topic, reference, "topic is full")];
                    }
                    let mut rx = room.add_member(member).await;
                    let tx = conn_tx.clone();
                    let forwarder = tokio::spawn(async move {
                        loop {
                            match rx.recv().await {
                                Ok(envelope) => {
                                    if envelope.is_for(member) && tx.send(envelope).await.is_err() {
                                        break;
                                    }
                                }
                                Err(RecvError::Lagged(skipped)) => {
                                    log::warn!("Member {member} lagged, {skipped} frames dropped");
                                }
                                Err(RecvError::Closed) => break,
                            }
                        }
                    });
                    joined.insert(topic.clone(), forwarder);
                    log::info!("Member {member} joined {topic}");
                }
                let presences = room.presence_list().await;
                match Frame::joined(topic.as_str(), reference, &presences) {
                    Ok(reply) => vec![reply],
                    Err(e) => vec![Frame::error(topic, reference, e.to_string())],
                }
            }

            FrameKind::Leave => {
                if let Some(forwarder) = joined.remove(&topic) {
                    forwarder.abort();
                    if let Some(room) = rooms.get(&topic).await {
                        room.remove_member(member).await;
                    }
                    rooms.remove_if_empty(&topic).await;
                    log::info!("Member {member} left {topic}");
                }
                Vec::new()
            }

            FrameKind::Broadcast => {
                let Some(room) = Self::joined_room(rooms, joined, &topic).await else {
                    return vec![Frame::error(topic, reference, "not joined")];
                };
                let envelope = Envelope {
                    origin: Some(member),
                    kind: FrameKind::Broadcast,
                    bytes: raw,
                };
                let receivers = room.publish_envelope(Arc::new(envelope));
                log::debug!("Broadcast {} on {topic} to {receivers} receivers", frame.name);
                vec![Frame::ack(topic, reference)]
            }

            FrameKind::Track => {
                let Some(room) = Self::joined_room(rooms, joined, &topic).await else {
                    return vec![Frame::error(topic, reference, "not joined")];
                };
                match frame.json() {
                    Ok(state) => {
                        room.track(member, &frame.name, state).await;
                        vec![Frame::ack(topic, reference)]
                    }
                    Err(e) => vec![Frame::error(topic, reference, e.to_string())],
                }
            }

            FrameKind::Untrack => {
                let Some(room) = Self::joined_room(rooms, joined, &topic).await else {
                    return vec![Frame::error(topic, reference, "not joined")];
                };
                room.untrack(member, &frame.name).await;
                vec![Frame::ack(topic, reference)]
            }

            FrameKind::Ping => vec![Frame::pong()],

            other => {
                log::debug!("Unexpected {other:?} frame from member {member}");
                vec![Frame::error(topic, reference, ProtocolError::UnexpectedFrame(other).to_string())]
            }
        }
    }

    async fn joined_room(
        rooms: &RoomManager,
        joined: &HashMap<String, JoinHandle<()>>,
        topic: &str,
    ) -> Option<Arc<crate::broadcast::BroadcastGroup>> {
        if joined.contains_key(topic) {
            rooms.get(topic).await
        } else {
            None
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        for router in self.feed_routers.lock().drain(..) {
            router.abort();
        }
    }
}
