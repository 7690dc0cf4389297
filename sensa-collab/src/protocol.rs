//! Wire protocol between realtime clients and the relay.
//!
//! Every WebSocket message is one bincode-encoded [`Frame`]:
//! ```text
//! ┌──────┬────────────────┬───────────┬────────┬──────────────┐
//! │ kind │ topic          │ reference │ name   │ payload      │
//! │ u8   │ session:<uuid> │ u64       │ string │ JSON bytes   │
//! └──────┴────────────────┴───────────┴────────┴──────────────┘
//! ```
//!
//! Payloads stay JSON because broadcast bodies are arbitrary JSON values
//! and the event enums below are internally tagged, neither of which
//! bincode can describe.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Client asks to join a topic.
    Join = 1,
    /// Relay accepted a join; payload lists the current presences.
    Joined = 2,
    Leave = 3,
    /// Event fanned out to the other members of the topic.
    Broadcast = 4,
    /// Relay processed the request with the same reference.
    Ack = 5,
    Track = 6,
    Untrack = 7,
    /// Presence join/update/leave for the topic.
    Presence = 8,
    /// Persisted row changed.
    TableChange = 9,
    /// Relay refused the request with the same reference.
    Error = 10,
    Ping = 11,
    Pong = 12,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    pub topic: String,
    /// Request id chosen by the client, echoed in `Ack`/`Joined`/`Error`. 0 when unused.
    pub reference: u64,
    /// Broadcast event name, presence key, or error text.
    pub name: String,
    pub payload: Vec<u8>,
}

impl Frame {
    fn new(kind: FrameKind, topic: impl Into<String>, reference: u64, name: impl Into<String>) -> Self {
        Self {
            kind,
            topic: topic.into(),
            reference,
            name: name.into(),
            payload: Vec::new(),
        }
    }

    fn with_json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, ProtocolError> {
        self.payload =
            serde_json::to_vec(value).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(self)
    }

    pub fn join(topic: impl Into<String>, reference: u64) -> Self {
        Self::new(FrameKind::Join, topic, reference, "")
    }

    pub fn joined(
        topic: impl Into<String>,
        reference: u64,
        presences: &[PresenceEvent],
    ) -> Result<Self, ProtocolError> {
        Self::new(FrameKind::Joined, topic, reference, "").with_json(presences)
    }

    pub fn leave(topic: impl Into<String>) -> Self {
        Self::new(FrameKind::Leave, topic, 0, "")
    }

    pub fn broadcast(
        topic: impl Into<String>,
        reference: u64,
        event: impl Into<String>,
        payload: &Value,
    ) -> Result<Self, ProtocolError> {
        Self::new(FrameKind::Broadcast, topic, reference, event).with_json(payload)
    }

    pub fn ack(topic: impl Into<String>, reference: u64) -> Self {
        Self::new(FrameKind::Ack, topic, reference, "")
    }

    pub fn track(
        topic: impl Into<String>,
        reference: u64,
        key: impl Into<String>,
        state: &Value,
    ) -> Result<Self, ProtocolError> {
        Self::new(FrameKind::Track, topic, reference, key).with_json(state)
    }

    pub fn untrack(topic: impl Into<String>, reference: u64, key: impl Into<String>) -> Self {
        Self::new(FrameKind::Untrack, topic, reference, key)
    }

    pub fn presence(topic: impl Into<String>, event: &PresenceEvent) -> Result<Self, ProtocolError> {
        Self::new(FrameKind::Presence, topic, 0, event.key()).with_json(event)
    }

    pub fn table_change(topic: impl Into<String>, change: &TableChange) -> Result<Self, ProtocolError> {
        Self::new(FrameKind::TableChange, topic, 0, change.table.name()).with_json(change)
    }

    pub fn error(topic: impl Into<String>, reference: u64, message: impl Into<String>) -> Self {
        Self::new(FrameKind::Error, topic, reference, message)
    }

    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, "", 0, "")
    }

    pub fn pong() -> Self {
        Self::new(FrameKind::Pong, "", 0, "")
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    /// Parse the JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Topic name of a session's channel.
pub fn session_topic(session_id: SessionId) -> String {
    format!("session:{session_id}")
}

/// An event received through [`RealtimeTransport::broadcast`](crate::RealtimeTransport::broadcast).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    Join { key: String, state: Value },
    Update { key: String, state: Value },
    Leave { key: String },
}

impl PresenceEvent {
    pub fn key(&self) -> &str {
        match self {
            PresenceEvent::Join { key, .. }
            | PresenceEvent::Update { key, .. }
            | PresenceEvent::Leave { key } => key,
        }
    }

    pub fn state(&self) -> Option<&Value> {
        match self {
            PresenceEvent::Join { state, .. } | PresenceEvent::Update { state, .. } => Some(state),
            PresenceEvent::Leave { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Sessions,
    Participants,
    Operations,
    Snapshots,
    ChatMessages,
    Invitations,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Sessions => "sessions",
            Table::Participants => "participants",
            Table::Operations => "operations",
            Table::Snapshots => "snapshots",
            Table::ChatMessages => "chat_messages",
            Table::Invitations => "invitations",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Notification that a persisted row changed.
///
/// `record` is the row after the change, or the removed row for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    pub table: Table,
    pub kind: ChangeKind,
    pub session_id: SessionId,
    pub record: Value,
}

impl TableChange {
    pub fn record_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.record.clone())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected {0:?} frame")]
    UnexpectedFrame(FrameKind),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for the relay")]
    Timeout,
    #[error("relay refused: {0}")]
    Refused(String),
}
