//! Records shared between the client, the backing store and the wire.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sensa_core::{EditOp, MindMapEdge, MindMapNode, Position};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(SessionId);
uuid_id!(
    /// Authenticated account id.
    UserId
);
uuid_id!(ParticipantId);
uuid_id!(OperationId);
uuid_id!(SnapshotId);
uuid_id!(MessageId);
uuid_id!(
    /// One transport connection. A user with two tabs has two clients.
    ClientId
);

/// The signed-in user a context acts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

impl Identity {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
    InviteOnly,
}

impl Visibility {
    /// Whether joining needs to be the creator or hold an invitation.
    pub fn is_restricted(self) -> bool {
        !matches!(self, Visibility::Public)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Facilitator,
    Participant,
    Observer,
}

impl Role {
    pub fn can_author(self) -> bool {
        !matches!(self, Role::Observer)
    }

    pub fn can_moderate(self) -> bool {
        matches!(self, Role::Facilitator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub visibility: Visibility,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// Keep the session active after the last participant leaves.
    #[serde(default = "default_true")]
    pub persist_when_empty: bool,
}

fn default_true() -> bool {
    true
}

impl Session {
    pub fn new(name: impl Into<String>, visibility: Visibility, created_by: UserId) -> Self {
        Self {
            id: SessionId::new(),
            name: name.into(),
            visibility,
            created_by,
            created_at: Utc::now(),
            status: SessionStatus::Active,
            persist_when_empty: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub cursor: Option<Position>,
    pub status: ParticipantStatus,
}

impl Participant {
    pub fn new(session_id: SessionId, identity: &Identity, role: Role) -> Self {
        Self {
            id: ParticipantId::new(),
            session_id,
            user_id: identity.user_id,
            display_name: identity.display_name.clone(),
            role,
            joined_at: Utc::now(),
            cursor: None,
            status: ParticipantStatus::Connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ParticipantStatus::Connected
    }
}

/// One authored edit. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub session_id: SessionId,
    pub author: UserId,
    pub timestamp: DateTime<Utc>,
    pub edit: EditOp,
}

impl Operation {
    pub fn new(session_id: SessionId, author: UserId, edit: EditOp) -> Self {
        Self {
            id: OperationId::new(),
            session_id,
            author,
            timestamp: Utc::now(),
            edit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub session_id: SessionId,
    pub name: String,
    pub nodes: Vec<MindMapNode>,
    pub edges: Vec<MindMapEdge>,
    pub is_auto_save: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// `name` falls back to "Auto-save <ts>" or "Snapshot <ts>".
    pub fn new(
        session_id: SessionId,
        created_by: UserId,
        name: Option<String>,
        nodes: Vec<MindMapNode>,
        edges: Vec<MindMapEdge>,
        is_auto_save: bool,
    ) -> Self {
        let created_at = Utc::now();
        let name = match name.map(|n| n.trim().to_string()) {
            Some(n) if !n.is_empty() => n,
            _ => {
                let stamp = created_at.format("%Y-%m-%d %H:%M:%S");
                if is_auto_save {
                    format!("Auto-save {stamp}")
                } else {
                    format!("Snapshot {stamp}")
                }
            }
        };
        Self {
            id: SnapshotId::new(),
            session_id,
            name,
            nodes,
            edges,
            is_auto_save,
            created_by,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub invited_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender: UserId,
    pub sender_name: String,
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    #[default]
    Select,
    Pan,
    AddNode,
    Connect,
    Text,
    Erase,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, zoom: 1.0 }
    }
}

/// Ephemeral per-client state shared through presence tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub key: String,
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub cursor: Option<Position>,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default)]
    pub tool: Tool,
    #[serde(default)]
    pub viewport: Option<Viewport>,
    pub updated_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn new(key: impl Into<String>, identity: &Identity) -> Self {
        Self {
            key: key.into(),
            user_id: identity.user_id,
            display_name: identity.display_name.clone(),
            cursor: None,
            is_typing: false,
            tool: Tool::default(),
            viewport: None,
            updated_at: Utc::now(),
        }
    }
}
