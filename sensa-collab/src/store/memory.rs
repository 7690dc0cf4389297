//! In-process store used when embedding the core and in tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use sensa_core::Position;

use super::{check_membership, BackingStore, ChangeFeed, StoreError, StoreResult};
use crate::model::{
    ChatMessage, Invitation, Operation, Participant, ParticipantId, ParticipantStatus, Session,
    SessionId, SessionStatus, Snapshot, SnapshotId, UserId,
};
use crate::protocol::{ChangeKind, Table};

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, Session>,
    participants: HashMap<ParticipantId, Participant>,
    invitations: HashSet<(SessionId, UserId)>,
    operations: Vec<Operation>,
    snapshots: Vec<Snapshot>,
    chat_messages: Vec<ChatMessage>,
}

/// Keeps every table in memory. [`set_fail_writes`](Self::set_fail_writes)
/// makes all writes fail with [`StoreError::Unavailable`].
pub struct MemoryStore {
    tables: RwLock<Tables>,
    feed: ChangeFeed,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            feed: ChangeFeed::default(),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("writes disabled".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        self.check_writable()?;
        self.tables.write().await.sessions.insert(session.id, session.clone());
        self.feed.publish(Table::Sessions, ChangeKind::Insert, session.id, session);
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> StoreResult<Session> {
        self.tables
            .read()
            .await
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    async fn update_session_status(&self, id: SessionId, status: SessionStatus) -> StoreResult<Session> {
        self.check_writable()?;
        let updated = {
            let mut tables = self.tables.write().await;
            let session = tables
                .sessions
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
            session.status = status;
            session.clone()
        };
        self.feed.publish(Table::Sessions, ChangeKind::Update, id, &updated);
        Ok(updated)
    }

    async fn insert_invitation(&self, invitation: &Invitation) -> StoreResult<()> {
        self.check_writable()?;
        {
            let mut tables = self.tables.write().await;
            if !tables.sessions.contains_key(&invitation.session_id) {
                return Err(StoreError::NotFound(format!("session {}", invitation.session_id)));
            }
            tables.invitations.insert((invitation.session_id, invitation.user_id));
        }
        self.feed
            .publish(Table::Invitations, ChangeKind::Insert, invitation.session_id, invitation);
        Ok(())
    }

    async fn has_invitation(&self, session_id: SessionId, user_id: UserId) -> StoreResult<bool> {
        Ok(self.tables.read().await.invitations.contains(&(session_id, user_id)))
    }

    async fn upsert_participant(&self, participant: &Participant) -> StoreResult<()> {
        self.check_writable()?;
        let kind = {
            let mut tables = self.tables.write().await;
            let session = tables
                .sessions
                .get(&participant.session_id)
                .ok_or_else(|| StoreError::NotFound(format!("session {}", participant.session_id)))?;
            let invited = tables
                .invitations
                .contains(&(participant.session_id, participant.user_id));
            check_membership(session, participant, invited)?;

            match tables.participants.insert(participant.id, participant.clone()) {
                Some(_) => ChangeKind::Update,
                None => ChangeKind::Insert,
            }
        };
        self.feed
            .publish(Table::Participants, kind, participant.session_id, participant);
        Ok(())
    }

    async fn mark_participant_disconnected(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> StoreResult<Option<Participant>> {
        self.check_writable()?;
        let updated = {
            let mut tables = self.tables.write().await;
            match tables.participants.get_mut(&participant_id) {
                Some(p) if p.session_id == session_id => {
                    p.status = ParticipantStatus::Disconnected;
                    p.cursor = None;
                    Some(p.clone())
                }
                _ => None,
            }
        };
        if let Some(p) = &updated {
            self.feed.publish(Table::Participants, ChangeKind::Update, session_id, p);
        }
        Ok(updated)
    }

    async fn update_participant_cursor(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        cursor: Position,
    ) -> StoreResult<Option<Participant>> {
        self.check_writable()?;
        let updated = {
            let mut tables = self.tables.write().await;
            match tables.participants.get_mut(&participant_id) {
                Some(p) if p.session_id == session_id && p.is_connected() => {
                    p.cursor = Some(cursor);
                    Some(p.clone())
                }
                _ => None,
            }
        };
        if let Some(p) = &updated {
            self.feed.publish(Table::Participants, ChangeKind::Update, session_id, p);
        }
        Ok(updated)
    }

    async fn list_participants(&self, session_id: SessionId) -> StoreResult<Vec<Participant>> {
        let tables = self.tables.read().await;
        let mut participants: Vec<Participant> = tables
            .participants
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        participants.sort_by_key(|p| p.joined_at);
        Ok(participants)
    }

    async fn insert_operation(&self, operation: &Operation) -> StoreResult<()> {
        self.check_writable()?;
        self.tables.write().await.operations.push(operation.clone());
        self.feed
            .publish(Table::Operations, ChangeKind::Insert, operation.session_id, operation);
        Ok(())
    }

    async fn list_operations(&self, session_id: SessionId) -> StoreResult<Vec<Operation>> {
        let tables = self.tables.read().await;
        Ok(tables
            .operations
            .iter()
            .filter(|op| op.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        self.check_writable()?;
        self.tables.write().await.snapshots.push(snapshot.clone());
        self.feed
            .publish(Table::Snapshots, ChangeKind::Insert, snapshot.session_id, snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, session_id: SessionId, id: SnapshotId) -> StoreResult<Snapshot> {
        self.tables
            .read()
            .await
            .snapshots
            .iter()
            .find(|s| s.id == id && s.session_id == session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("snapshot {id}")))
    }

    async fn list_snapshots(&self, session_id: SessionId) -> StoreResult<Vec<Snapshot>> {
        let tables = self.tables.read().await;
        Ok(tables
            .snapshots
            .iter()
            .rev()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn insert_chat_message(&self, message: &ChatMessage) -> StoreResult<()> {
        self.check_writable()?;
        self.tables.write().await.chat_messages.push(message.clone());
        self.feed
            .publish(Table::ChatMessages, ChangeKind::Insert, message.session_id, message);
        Ok(())
    }

    async fn list_chat_messages(&self, session_id: SessionId) -> StoreResult<Vec<ChatMessage>> {
        let tables = self.tables.read().await;
        Ok(tables
            .chat_messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }

    fn changes(&self) -> &ChangeFeed {
        &self.feed
    }
}
