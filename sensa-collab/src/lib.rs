//! # sensa-collab: Real-time collaboration core for Sensa
//!
//! Live sessions around a shared mind map: membership and roles, an
//! operation log broadcast between participants, snapshots, presence and
//! chat. The editor drives a [`CollabContext`] and renders the
//! [`CollabState`] it publishes.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  RealtimeTransport  ┌──────────────────────────┐
//! │ CollabContext │ ◄─────────────────► │ LocalRealtime/RelayServer│
//! │ (per editor)  │  broadcast,presence │ RoomManager              │
//! └──────┬────────┘  table changes      └────────────┬─────────────┘
//!        │                                           │ ChangeFeed
//!        ▼                                           │
//! ┌───────────────┐                                  │
//! │ BackingStore  │ ─────────────────────────────────┘
//! │ Memory/Rocks  │
//! └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`context`]: orchestrator and the UI-facing API
//! - [`session`], [`oplog`], [`presence`], [`chat`]: client-side state machines
//! - [`transport`]: channel abstraction with in-process and WebSocket backends
//! - [`protocol`]: bincode wire frames between [`WsTransport`] and [`RelayServer`]
//! - [`broadcast`]: topic fan-out and presence tracking shared by both backends
//! - [`server`]: self-hostable WebSocket relay
//! - [`store`]: backing store trait, in-memory and RocksDB implementations

pub mod broadcast;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod oplog;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;

pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use config::{from_toml_str, CollabConfig, ConfigError, RelayConfig};
pub use context::{CollabContext, OPERATION_EVENT};
pub use error::{CollabError, Result};
pub use model::{
    ChatMessage, ClientId, Identity, Invitation, MessageId, Operation, OperationId, Participant,
    ParticipantId, ParticipantStatus, PresenceRecord, Role, Session, SessionId, SessionStatus,
    Snapshot, SnapshotId, Tool, UserId, Viewport, Visibility,
};
pub use protocol::{Frame, FrameKind, PresenceEvent, ProtocolError, Table, TableChange};
pub use server::{RelayServer, RelayStats};
pub use session::ConnectionStatus;
pub use state::CollabState;
pub use store::{BackingStore, ChangeFeed, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use transport::{
    ChannelHandle, ChannelStatus, LocalRealtime, LocalTransport, RealtimeTransport, Subscription,
    TableFilter, WsTransport,
};

pub use sensa_core::{EditOp, MindMap, MindMapEdge, MindMapNode, Position};
