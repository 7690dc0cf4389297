//! Realtime transport: session-scoped channels carrying broadcasts,
//! presence and table-change notifications.
//!
//! Consumers register on a [`ChannelHandle`] and get a [`Subscription`]
//! stream back. A subscription yields every matching event delivered after
//! it was created and ends when the channel closes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};

use crate::error::Result;
use crate::model::{ClientId, SessionId};
use crate::protocol::{
    session_topic, BroadcastMessage, Frame, FrameKind, PresenceEvent, ProtocolError, Table,
    TableChange,
};

pub mod local;
pub mod ws;

pub use local::{LocalRealtime, LocalTransport};
pub use ws::WsTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Connecting,
    Connected,
    /// Connection lost or refused.
    Error,
    /// Closed by the client.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Broadcast(BroadcastMessage),
    Presence(PresenceEvent),
    TableChange(TableChange),
}

impl ChannelEvent {
    /// Turn a relay frame into the event it carries. `None` for control frames.
    pub fn from_frame(frame: &Frame) -> std::result::Result<Option<Self>, ProtocolError> {
        let event = match frame.kind {
            FrameKind::Broadcast => ChannelEvent::Broadcast(BroadcastMessage {
                event: frame.name.clone(),
                payload: frame.json()?,
            }),
            FrameKind::Presence => ChannelEvent::Presence(frame.json()?),
            FrameKind::TableChange => ChannelEvent::TableChange(frame.json()?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Which table changes a subscription wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFilter {
    pub table: Table,
    pub session_id: Option<SessionId>,
}

impl TableFilter {
    pub fn table(table: Table) -> Self {
        Self { table, session_id: None }
    }

    pub fn in_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn matches(&self, change: &TableChange) -> bool {
        change.table == self.table && self.session_id.is_none_or(|id| id == change.session_id)
    }
}

/// A filtered stream of channel events.
pub struct Subscription<T> {
    rx: broadcast::Receiver<ChannelEvent>,
    filter: Box<dyn Fn(ChannelEvent) -> Option<T> + Send + Sync>,
}

impl<T> Subscription<T> {
    fn new(
        rx: broadcast::Receiver<ChannelEvent>,
        filter: impl Fn(ChannelEvent) -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            filter: Box::new(filter),
        }
    }

    /// Next matching event, or `None` once the channel closed.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(item) = (self.filter)(event) {
                        return Some(item);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Subscription lagged, {skipped} events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event that is already buffered.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if let Some(item) = (self.filter)(event) {
                        return Some(item);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    log::warn!("Subscription lagged, {skipped} events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

struct ChannelInner {
    session_id: SessionId,
    topic: String,
    events: Mutex<Option<broadcast::Sender<ChannelEvent>>>,
    status: watch::Sender<ChannelStatus>,
    /// Presences currently tracked on the topic, by key.
    presences: Mutex<HashMap<String, Value>>,
}

/// Client-side end of one session channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<ChannelInner>,
}

impl ChannelHandle {
    pub fn new(session_id: SessionId, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (status, _) = watch::channel(ChannelStatus::Connecting);
        Self {
            inner: Arc::new(ChannelInner {
                session_id,
                topic: session_topic(session_id),
                events: Mutex::new(Some(events)),
                status,
                presences: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn status(&self) -> ChannelStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.events.lock().is_none()
    }

    pub fn same_channel(&self, other: &ChannelHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_status(&self, status: ChannelStatus) {
        if self.is_closed() && status != ChannelStatus::Closed {
            return;
        }
        self.inner.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                log::debug!("Channel {} {:?} -> {:?}", self.inner.topic, current, status);
                *current = status;
                true
            }
        });
    }

    /// Deliver an event to every live subscription. Presence events also
    /// update the tracked presence list.
    pub(crate) fn dispatch(&self, event: ChannelEvent) {
        if let ChannelEvent::Presence(presence) = &event {
            let mut presences = self.inner.presences.lock();
            match presence {
                PresenceEvent::Join { key, state } | PresenceEvent::Update { key, state } => {
                    presences.insert(key.clone(), state.clone());
                }
                PresenceEvent::Leave { key } => {
                    presences.remove(key);
                }
            }
        }
        if let Some(sender) = self.inner.events.lock().as_ref() {
            // No receivers just means nobody registered yet.
            let _ = sender.send(event);
        }
    }

    /// Presences tracked on the topic right now, including our own.
    pub fn presence_state(&self) -> HashMap<String, Value> {
        self.inner.presences.lock().clone()
    }

    /// End every subscription. Idempotent.
    pub(crate) fn close(&self) {
        let was_open = self.inner.events.lock().take().is_some();
        if was_open {
            self.inner.presences.lock().clear();
            self.set_status(ChannelStatus::Closed);
        }
    }

    fn subscribe_raw(&self) -> broadcast::Receiver<ChannelEvent> {
        match self.inner.events.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                // Closed: hand out a receiver that is already at its end.
                let (sender, rx) = broadcast::channel(1);
                drop(sender);
                rx
            }
        }
    }

    pub fn events(&self) -> Subscription<ChannelEvent> {
        Subscription::new(self.subscribe_raw(), Some)
    }

    /// Broadcasts named `event`.
    pub fn on_broadcast(&self, event: impl Into<String>) -> Subscription<BroadcastMessage> {
        let name = event.into();
        Subscription::new(self.subscribe_raw(), move |e| match e {
            ChannelEvent::Broadcast(msg) if msg.event == name => Some(msg),
            _ => None,
        })
    }

    pub fn on_presence_change(&self) -> Subscription<PresenceEvent> {
        Subscription::new(self.subscribe_raw(), |e| match e {
            ChannelEvent::Presence(p) => Some(p),
            _ => None,
        })
    }

    pub fn on_table_change(&self, filter: TableFilter) -> Subscription<TableChange> {
        Subscription::new(self.subscribe_raw(), move |e| match e {
            ChannelEvent::TableChange(change) if filter.matches(&change) => Some(change),
            _ => None,
        })
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("topic", &self.inner.topic)
            .field("status", &self.status())
            .finish()
    }
}

/// A realtime service reachable by one client.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Identity of this client connection.
    fn client_id(&self) -> ClientId;

    /// Join the session's topic. A second call for the same session
    /// returns the same live handle.
    async fn open_channel(&self, session_id: SessionId) -> Result<ChannelHandle>;

    /// Send `payload` to the other members. Resolves once the service
    /// accepted it; the sender never receives its own broadcast.
    async fn broadcast(&self, channel: &ChannelHandle, event: &str, payload: Value) -> Result<()>;

    async fn track(&self, channel: &ChannelHandle, key: &str, state: Value) -> Result<()>;

    async fn untrack(&self, channel: &ChannelHandle, key: &str) -> Result<()>;

    /// Leave the topic and end every subscription. Idempotent.
    async fn close_channel(&self, channel: &ChannelHandle);
}
