//! Backing store for the authoritative session records.
//!
//! ```text
//! CollabContext ── BackingStore ──┬── MemoryStore (in-process)
//!                                 └── RocksStore  (RocksDB)
//!                       │
//!                       ▼ every write
//!                  ChangeFeed ── RoomManager::route_table_change ── session:<uuid>
//! ```
//!
//! Stores enforce the join policy themselves, so a client cannot talk its
//! way into a restricted session.

use async_trait::async_trait;
use serde::Serialize;
use sensa_core::Position;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{
    ChatMessage, Invitation, Operation, Participant, ParticipantId, Role, Session, SessionId,
    SessionStatus, Snapshot, SnapshotId, UserId,
};
use crate::protocol::{ChangeKind, Table, TableChange};

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    /// Membership denied. Carries no reason on purpose.
    #[error("forbidden")]
    Forbidden,
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// CRUD over sessions and their child records, each scoped by session id.
///
/// Every successful write publishes a [`TableChange`] on [`changes`](Self::changes).
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> StoreResult<()>;

    async fn get_session(&self, id: SessionId) -> StoreResult<Session>;

    async fn update_session_status(&self, id: SessionId, status: SessionStatus) -> StoreResult<Session>;

    async fn insert_invitation(&self, invitation: &Invitation) -> StoreResult<()>;

    async fn has_invitation(&self, session_id: SessionId, user_id: UserId) -> StoreResult<bool>;

    /// Insert or replace a participant after checking the join policy:
    /// the session must exist and be active, only its creator may be
    /// facilitator, and restricted sessions admit the creator and invitees.
    async fn upsert_participant(&self, participant: &Participant) -> StoreResult<()>;

    /// Mark a participant disconnected without re-checking membership.
    /// Returns `None` when no such participant exists.
    async fn mark_participant_disconnected(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> StoreResult<Option<Participant>>;

    /// Record a connected participant's last known cursor. Returns `None`
    /// when the participant is unknown or already disconnected.
    async fn update_participant_cursor(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        cursor: Position,
    ) -> StoreResult<Option<Participant>>;

    async fn list_participants(&self, session_id: SessionId) -> StoreResult<Vec<Participant>>;

    async fn insert_operation(&self, operation: &Operation) -> StoreResult<()>;

    /// Oldest first.
    async fn list_operations(&self, session_id: SessionId) -> StoreResult<Vec<Operation>>;

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()>;

    async fn get_snapshot(&self, session_id: SessionId, id: SnapshotId) -> StoreResult<Snapshot>;

    /// Most recent first.
    async fn list_snapshots(&self, session_id: SessionId) -> StoreResult<Vec<Snapshot>>;

    async fn insert_chat_message(&self, message: &ChatMessage) -> StoreResult<()>;

    /// Oldest first.
    async fn list_chat_messages(&self, session_id: SessionId) -> StoreResult<Vec<ChatMessage>>;

    fn changes(&self) -> &ChangeFeed;
}

/// Join policy shared by every store.
pub fn check_membership(session: &Session, participant: &Participant, invited: bool) -> StoreResult<()> {
    if !session.is_active() {
        return Err(StoreError::NotFound(format!("session {}", session.id)));
    }
    let is_creator = participant.user_id == session.created_by;
    if participant.role == Role::Facilitator && !is_creator {
        return Err(StoreError::Forbidden);
    }
    if session.visibility.is_restricted() && !is_creator && !invited {
        return Err(StoreError::Forbidden);
    }
    Ok(())
}

/// Fan-out of row changes to whoever routes them onto realtime topics.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<TableChange>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.sender.subscribe()
    }

    pub fn publish<T: Serialize>(&self, table: Table, kind: ChangeKind, session_id: SessionId, record: &T) {
        let record = match serde_json::to_value(record) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Dropping {} change for session {session_id}: {e}", table.name());
                return;
            }
        };
        // No subscribers is fine: nobody is routing changes yet.
        let _ = self.sender.send(TableChange {
            table,
            kind,
            session_id,
            record,
        });
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Identity, Visibility};

    fn session(visibility: Visibility, creator: &Identity) -> Session {
        Session::new("Biology 101", visibility, creator.user_id)
    }

    #[test]
    fn test_public_session_admits_anyone() {
        let creator = Identity::new("Ada");
        let guest = Identity::new("Bob");
        let s = session(Visibility::Public, &creator);
        let p = Participant::new(s.id, &guest, Role::Participant);
        assert!(check_membership(&s, &p, false).is_ok());
    }

    #[test]
    fn test_only_creator_is_facilitator() {
        let creator = Identity::new("Ada");
        let guest = Identity::new("Bob");
        let s = session(Visibility::Public, &creator);

        let own = Participant::new(s.id, &creator, Role::Facilitator);
        let other = Participant::new(s.id, &guest, Role::Facilitator);
        assert!(check_membership(&s, &own, false).is_ok());
        assert_eq!(check_membership(&s, &other, true), Err(StoreError::Forbidden));
    }

    #[test]
    fn test_restricted_session_needs_invitation() {
        let creator = Identity::new("Ada");
        let guest = Identity::new("Bob");
        for visibility in [Visibility::Private, Visibility::InviteOnly] {
            let s = session(visibility, &creator);
            let p = Participant::new(s.id, &guest, Role::Participant);
            assert_eq!(check_membership(&s, &p, false), Err(StoreError::Forbidden));
            assert!(check_membership(&s, &p, true).is_ok());
        }
    }

    #[test]
    fn test_ended_session_is_not_found() {
        let creator = Identity::new("Ada");
        let mut s = session(Visibility::Public, &creator);
        s.status = SessionStatus::Ended;
        let p = Participant::new(s.id, &creator, Role::Facilitator);
        assert!(matches!(check_membership(&s, &p, false), Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_change_feed_delivers_to_subscribers() {
        let feed = ChangeFeed::new(8);
        let mut rx = feed.subscribe();
        let creator = Identity::new("Ada");
        let s = session(Visibility::Public, &creator);

        feed.publish(Table::Sessions, ChangeKind::Insert, s.id, &s);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.table, Table::Sessions);
        assert_eq!(change.record_as::<Session>().unwrap(), s);
    }
}
