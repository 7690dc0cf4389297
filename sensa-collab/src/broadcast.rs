//! Topic fan-out with presence tracking.
//!
//! Every topic has one tokio broadcast channel; each member holds an
//! independent receiver that buffers up to `capacity` envelopes. Envelopes
//! are encoded once and shared by all receivers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use crate::model::ClientId;
use crate::protocol::{session_topic, Frame, FrameKind, PresenceEvent, ProtocolError, TableChange};

/// One encoded frame on its way to the members of a topic.
#[derive(Debug)]
pub struct Envelope {
    /// Member that sent it. `None` for relay-originated frames.
    pub origin: Option<ClientId>,
    pub kind: FrameKind,
    pub bytes: Vec<u8>,
}

impl Envelope {
    /// Encode `frame` once for every receiver of the topic.
    pub fn from_frame(origin: Option<ClientId>, frame: &Frame) -> Result<Self, ProtocolError> {
        Ok(Self {
            origin,
            kind: frame.kind,
            bytes: frame.encode()?,
        })
    }

    /// Whether `member` should see this envelope. Broadcasts skip their sender.
    pub fn is_for(&self, member: ClientId) -> bool {
        !(self.kind == FrameKind::Broadcast && self.origin == Some(member))
    }
}

/// Point-in-time counters for one topic.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_members: usize,
    pub tracked_presences: usize,
}

#[derive(Debug, Clone)]
struct TrackedPresence {
    owner: ClientId,
    state: Value,
}

/// Members and presences of one topic.
pub struct BroadcastGroup {
    topic: String,
    sender: broadcast::Sender<Arc<Envelope>>,
    members: RwLock<HashSet<ClientId>>,
    presences: RwLock<HashMap<String, TrackedPresence>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create an empty group for `topic`.
    ///
    /// `capacity` is how many envelopes a member may fall behind before it
    /// starts losing them.
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            topic: topic.into(),
            sender,
            members: RwLock::new(HashSet::new()),
            presences: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Add a member and return its receiver. Only envelopes sent after this
    /// call are delivered.
    pub async fn add_member(&self, member: ClientId) -> broadcast::Receiver<Arc<Envelope>> {
        let mut members = self.members.write().await;
        members.insert(member);
        self.sender.subscribe()
    }

    /// Remove a member and drop every presence it tracked. Returns the leave
    /// events, already published to the remaining members.
    pub async fn remove_member(&self, member: ClientId) -> Vec<PresenceEvent> {
        self.members.write().await.remove(&member);

        let left: Vec<String> = {
            let mut presences = self.presences.write().await;
            let keys: Vec<String> = presences
                .iter()
                .filter(|(_, p)| p.owner == member)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                presences.remove(key);
            }
            keys
        };

        let mut events = Vec::with_capacity(left.len());
        for key in left {
            let event = PresenceEvent::Leave { key };
            self.publish_presence(None, &event);
            events.push(event);
        }
        events
    }

    /// Whether `member` joined and has not left.
    pub async fn has_member(&self, member: ClientId) -> bool {
        self.members.read().await.contains(&member)
    }

    /// Number of joined members.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Encode and fan out a frame. Returns the number of receivers.
    pub fn publish(&self, origin: Option<ClientId>, frame: &Frame) -> Result<usize, ProtocolError> {
        let envelope = Envelope::from_frame(origin, frame)?;
        Ok(self.publish_envelope(Arc::new(envelope)))
    }

    /// Fan out an already encoded envelope.
    pub fn publish_envelope(&self, envelope: Arc<Envelope>) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    fn publish_presence(&self, origin: Option<ClientId>, event: &PresenceEvent) {
        match Frame::presence(self.topic.as_str(), event) {
            Ok(frame) => {
                if let Err(e) = self.publish(origin, &frame) {
                    log::warn!("Dropping presence event on {}: {e}", self.topic);
                }
            }
            Err(e) => log::warn!("Dropping presence event on {}: {e}", self.topic),
        }
    }

    /// Record `state` under `key` for `owner` and publish a join or update.
    pub async fn track(&self, owner: ClientId, key: &str, state: Value) -> PresenceEvent {
        let previous = {
            let mut presences = self.presences.write().await;
            presences.insert(
                key.to_string(),
                TrackedPresence {
                    owner,
                    state: state.clone(),
                },
            )
        };
        let event = match previous {
            Some(_) => PresenceEvent::Update {
                key: key.to_string(),
                state,
            },
            None => PresenceEvent::Join {
                key: key.to_string(),
                state,
            },
        };
        self.publish_presence(Some(owner), &event);
        event
    }

    /// Drop `key` if `owner` tracked it and publish the leave.
    pub async fn untrack(&self, owner: ClientId, key: &str) -> Option<PresenceEvent> {
        {
            let mut presences = self.presences.write().await;
            match presences.get(key) {
                Some(p) if p.owner == owner => {
                    presences.remove(key);
                }
                _ => return None,
            }
        }
        let event = PresenceEvent::Leave {
            key: key.to_string(),
        };
        self.publish_presence(Some(owner), &event);
        Some(event)
    }

    /// Current presences as join events, for members that just joined.
    pub async fn presence_list(&self) -> Vec<PresenceEvent> {
        self.presences
            .read()
            .await
            .iter()
            .map(|(key, p)| PresenceEvent::Join {
                key: key.clone(),
                state: p.state.clone(),
            })
            .collect()
    }

    /// Snapshot of the topic's counters.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
            tracked_presences: self.presences.read().await.len(),
        }
    }

    /// Per-member buffer size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps topic names to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    /// Groups created later get `default_capacity` as their buffer size.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Group for `topic`, opening it on first use.
    pub async fn get_or_create(&self, topic: &str) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(topic) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock
        if let Some(room) = rooms.get(topic) {
            return room.clone();
        }
        let room = Arc::new(BroadcastGroup::new(topic, self.default_capacity));
        rooms.insert(topic.to_string(), room.clone());
        log::debug!("Opened topic {topic}");
        room
    }

    /// Group for `topic`, if one is open.
    pub async fn get(&self, topic: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(topic).cloned()
    }

    /// Close `topic` once its last member left. Returns whether it was closed.
    pub async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(topic) {
            if room.member_count().await == 0 {
                rooms.remove(topic);
                log::debug!("Closed empty topic {topic}");
                return true;
            }
        }
        false
    }

    /// Number of open topics.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Names of the open topics, in no particular order.
    pub async fn active_topics(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Deliver a table change to its session's topic. Returns the number of
    /// receivers, 0 when nobody is on the topic.
    pub async fn route_table_change(&self, change: &TableChange) -> usize {
        let topic = session_topic(change.session_id);
        let Some(room) = self.get(&topic).await else {
            return 0;
        };
        match Frame::table_change(topic.as_str(), change) {
            Ok(frame) => room.publish(None, &frame).unwrap_or_else(|e| {
                log::warn!("Dropping {} change on {topic}: {e}", change.table.name());
                0
            }),
            Err(e) => {
                log::warn!("Dropping {} change on {topic}: {e}", change.table.name());
                0
            }
        }
    }
}
