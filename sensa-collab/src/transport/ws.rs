//! WebSocket client for [`RelayServer`](crate::RelayServer).
//!
//! One connection multiplexes every session channel of a client. A writer
//! task drains the outgoing queue, a reader task dispatches incoming frames
//! to channel handles and resolves pending requests by reference. When the
//! socket drops, the next `open_channel` dials the relay again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{ChannelEvent, ChannelHandle, ChannelStatus, RealtimeTransport};
use crate::config::{CollabConfig, Validate};
use crate::error::{CollabError, Result};
use crate::model::{ClientId, SessionId};
use crate::protocol::{session_topic, Frame, FrameKind, PresenceEvent, ProtocolError};

type Reply = std::result::Result<Frame, ProtocolError>;

struct Shared {
    channels: Mutex<HashMap<String, ChannelHandle>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    connected: AtomicBool,
}

impl Shared {
    fn handle_frame(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Ack | FrameKind::Joined | FrameKind::Error => {
                let waiter = self.pending.lock().remove(&frame.reference);
                match waiter {
                    Some(tx) => {
                        let reply = if frame.kind == FrameKind::Error {
                            Err(ProtocolError::Refused(frame.name.clone()))
                        } else {
                            Ok(frame)
                        };
                        let _ = tx.send(reply);
                    }
                    None if frame.kind == FrameKind::Error => {
                        log::warn!("Relay error on {}: {}", frame.topic, frame.name);
                    }
                    None => log::debug!("Late {:?} for reference {}", frame.kind, frame.reference),
                }
            }
            FrameKind::Broadcast | FrameKind::Presence | FrameKind::TableChange => {
                let handle = self.channels.lock().get(&frame.topic).cloned();
                let Some(handle) = handle else {
                    log::debug!("Frame for unknown topic {}", frame.topic);
                    return;
                };
                match ChannelEvent::from_frame(&frame) {
                    Ok(Some(event)) => handle.dispatch(event),
                    Ok(None) => {}
                    Err(e) => log::warn!("Dropping undecodable frame on {}: {e}", frame.topic),
                }
            }
            FrameKind::Pong => {}
            other => log::debug!("Ignoring {}", ProtocolError::UnexpectedFrame(other)),
        }
    }

    fn connection_lost(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        log::warn!("Connection to relay lost");
        for handle in self.channels.lock().values() {
            handle.set_status(ChannelStatus::Error);
        }
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(ProtocolError::ConnectionClosed));
        }
    }
}

/// One live socket to the relay and the channels joined over it.
struct Link {
    outgoing: mpsc::Sender<Vec<u8>>,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    async fn dial(url: &str, capacity: usize, heartbeat: Duration) -> Result<Self> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| CollabError::channel(format!("cannot reach relay at {url}: {e}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let shared = Arc::new(Shared {
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        });

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(capacity);
        let writer_shared = shared.clone();
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
            writer_shared.connection_lost();
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match Frame::decode(&data) {
                        Ok(frame) => reader_shared.handle_frame(frame),
                        Err(e) => log::warn!("Dropping undecodable relay message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader_shared.connection_lost();
        });

        let ping_tx = out_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Ok(ping) = Frame::ping().encode() else { break };
                if ping_tx.send(ping).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            outgoing: out_tx,
            shared,
            tasks: vec![writer, reader, heartbeat],
        })
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        for handle in self.shared.channels.lock().values() {
            handle.close();
        }
    }
}

pub struct WsTransport {
    client_id: ClientId,
    url: String,
    capacity: usize,
    ack_timeout: Duration,
    heartbeat: Duration,
    link: Mutex<Arc<Link>>,
    redial: tokio::sync::Mutex<()>,
    next_reference: AtomicU64,
}

impl WsTransport {
    /// Connect to a relay at `url` (e.g. `ws://127.0.0.1:9090`).
    ///
    /// A lost connection is redialed by the next
    /// [`open_channel`](RealtimeTransport::open_channel); channels opened
    /// over the old socket are never revived.
    pub async fn connect(url: impl Into<String>, config: &CollabConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CollabError::validation(e.to_string()))?;
        let url = url.into();
        let link = Link::dial(&url, config.channel_capacity, config.heartbeat_interval()).await?;
        log::info!("Connected to relay at {url}");

        Ok(Self {
            client_id: ClientId::new(),
            url,
            capacity: config.channel_capacity,
            ack_timeout: config.ack_timeout(),
            heartbeat: config.heartbeat_interval(),
            link: Mutex::new(Arc::new(link)),
            redial: tokio::sync::Mutex::new(()),
            next_reference: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.link().is_connected()
    }

    fn link(&self) -> Arc<Link> {
        self.link.lock().clone()
    }

    /// The current link, dialing the relay again if the socket dropped.
    async fn live_link(&self) -> Result<Arc<Link>> {
        let link = self.link();
        if link.is_connected() {
            return Ok(link);
        }
        let _dialing = self.redial.lock().await;
        let link = self.link();
        if link.is_connected() {
            return Ok(link);
        }
        let fresh = Arc::new(Link::dial(&self.url, self.capacity, self.heartbeat).await?);
        *self.link.lock() = fresh.clone();
        log::info!("Reconnected to relay at {}", self.url);
        Ok(fresh)
    }

    fn next_reference(&self) -> u64 {
        self.next_reference.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a frame and wait for the relay's reply with the same reference.
    async fn request(&self, link: &Link, frame: Frame) -> Result<Frame> {
        if !link.is_connected() {
            return Err(ProtocolError::ConnectionClosed.into());
        }
        let reference = frame.reference;
        let bytes = frame.encode()?;
        let (tx, rx) = oneshot::channel();
        link.shared.pending.lock().insert(reference, tx);

        if link.outgoing.send(bytes).await.is_err() {
            link.shared.pending.lock().remove(&reference);
            return Err(ProtocolError::ConnectionClosed.into());
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply?),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                link.shared.pending.lock().remove(&reference);
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    /// The link `channel` was opened on, if it is still usable.
    fn link_for(&self, channel: &ChannelHandle) -> Result<Arc<Link>> {
        let status = channel.status();
        let link = self.link();
        let owned = link
            .shared
            .channels
            .lock()
            .get(channel.topic())
            .is_some_and(|h| h.same_channel(channel));
        match status {
            ChannelStatus::Connected if owned => Ok(link),
            status => Err(CollabError::channel(format!("channel {} is {status:?}", channel.topic()))),
        }
    }
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    async fn open_channel(&self, session_id: SessionId) -> Result<ChannelHandle> {
        let link = self.live_link().await?;
        let topic = session_topic(session_id);
        let handle = {
            let mut channels = link.shared.channels.lock();
            if let Some(existing) = channels.get(&topic) {
                if existing.status() == ChannelStatus::Connected {
                    return Ok(existing.clone());
                }
                existing.close();
            }
            let handle = ChannelHandle::new(session_id, self.capacity);
            channels.insert(topic.clone(), handle.clone());
            handle
        };

        match self.request(&link, Frame::join(topic.as_str(), self.next_reference())).await {
            Ok(reply) => {
                let presences: Vec<PresenceEvent> = reply.json().unwrap_or_else(|e| {
                    log::warn!("Ignoring malformed presence list for {topic}: {e}");
                    Vec::new()
                });
                for presence in presences {
                    handle.dispatch(ChannelEvent::Presence(presence));
                }
                handle.set_status(ChannelStatus::Connected);
                log::info!("Joined {topic} via {}", self.url);
                Ok(handle)
            }
            Err(e) => {
                handle.set_status(ChannelStatus::Error);
                let mut channels = link.shared.channels.lock();
                if channels.get(&topic).is_some_and(|h| h.same_channel(&handle)) {
                    channels.remove(&topic);
                }
                Err(e)
            }
        }
    }

    async fn broadcast(&self, channel: &ChannelHandle, event: &str, payload: Value) -> Result<()> {
        let link = self.link_for(channel)?;
        let frame = Frame::broadcast(channel.topic(), self.next_reference(), event, &payload)?;
        self.request(&link, frame).await?;
        Ok(())
    }

    async fn track(&self, channel: &ChannelHandle, key: &str, state: Value) -> Result<()> {
        let link = self.link_for(channel)?;
        let frame = Frame::track(channel.topic(), self.next_reference(), key, &state)?;
        self.request(&link, frame).await?;
        Ok(())
    }

    async fn untrack(&self, channel: &ChannelHandle, key: &str) -> Result<()> {
        let link = self.link_for(channel)?;
        self.request(&link, Frame::untrack(channel.topic(), self.next_reference(), key))
            .await?;
        Ok(())
    }

    async fn close_channel(&self, channel: &ChannelHandle) {
        let link = self.link();
        let removed = {
            let mut channels = link.shared.channels.lock();
            match channels.get(channel.topic()) {
                Some(h) if h.same_channel(channel) => channels.remove(channel.topic()),
                _ => None,
            }
        };
        if removed.is_some() && link.is_connected() {
            if let Ok(bytes) = Frame::leave(channel.topic()).encode() {
                let _ = link.outgoing.send(bytes).await;
            }
            log::info!("Left {}", channel.topic());
        }
        channel.close();
    }
}
