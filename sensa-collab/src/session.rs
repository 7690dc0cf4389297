//! Session lifecycle, membership and the participant roster.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};
use crate::model::{
    Identity, Invitation, Participant, ParticipantId, Role, Session, SessionId, SessionStatus,
    UserId, Visibility,
};
use crate::protocol::{ChangeKind, TableChange};
use crate::store::BackingStore;

/// Connection state of a [`CollabContext`](crate::CollabContext).
///
/// ```text
/// disconnected ──► connecting ──► connected ──► disconnected
///                      │  ▲           │
///                      ▼  │           ▼
///                      error ◄────────┘
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    /// Whether the state machine allows moving to `next`. Staying put is
    /// always allowed.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        self == next
            || matches!(
                (self, next),
                (Disconnected, Connecting)
                    | (Connecting, Connected)
                    | (Connecting, Error)
                    | (Connecting, Disconnected)
                    | (Connected, Disconnected)
                    | (Connected, Error)
                    | (Error, Connecting)
                    | (Error, Disconnected)
            )
    }
}

/// Trimmed, non-empty session name.
pub fn validate_session_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CollabError::validation("session name must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// Participants of the joined session, in join order.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    /// Roster from a store listing, sorted by join time.
    pub fn new(mut participants: Vec<Participant>) -> Self {
        participants.sort_by_key(|p| p.joined_at);
        Self { participants }
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn get(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Participants not yet marked disconnected.
    pub fn connected_count(&self) -> usize {
        self.participants.iter().filter(|p| p.is_connected()).count()
    }

    /// Insert or replace by participant id.
    pub fn upsert(&mut self, participant: Participant) {
        match self.participants.iter_mut().find(|p| p.id == participant.id) {
            Some(existing) => *existing = participant,
            None => self.participants.push(participant),
        }
    }

    /// Drop a participant, returning it if it was listed.
    pub fn remove(&mut self, id: ParticipantId) -> Option<Participant> {
        let index = self.participants.iter().position(|p| p.id == id)?;
        Some(self.participants.remove(index))
    }

    /// Merge one participants-table notification. Returns whether anything changed.
    pub fn apply_change(&mut self, change: &TableChange) -> bool {
        let participant: Participant = match change.record_as() {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Ignoring malformed participant change: {e}");
                return false;
            }
        };
        match change.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                if self.get(participant.id) == Some(&participant) {
                    return false;
                }
                self.upsert(participant);
                true
            }
            ChangeKind::Delete => self.remove(participant.id).is_some(),
        }
    }
}

/// Session and membership operations against the backing store.
pub struct SessionManager {
    store: Arc<dyn BackingStore>,
    identity: Identity,
}

impl SessionManager {
    /// Manager acting as `identity`.
    pub fn new(store: Arc<dyn BackingStore>, identity: Identity) -> Self {
        Self { store, identity }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Store a new active session owned by the caller.
    ///
    /// The name is trimmed and must not be empty. Store failures surface
    /// as [`CollabError::Persistence`].
    pub async fn create(
        &self,
        name: &str,
        visibility: Visibility,
        persist_when_empty: bool,
    ) -> Result<Session> {
        let name = validate_session_name(name)?;
        let mut session = Session::new(name, visibility, self.identity.user_id);
        session.persist_when_empty = persist_when_empty;
        self.store
            .insert_session(&session)
            .await
            .map_err(|e| CollabError::Persistence(e.to_string()))?;
        log::info!("Created session {} ({:?})", session.id, visibility);
        Ok(session)
    }

    /// Register the caller as a participant. The creator always joins as
    /// facilitator; everyone else gets `requested` if the store allows it.
    pub async fn admit(&self, session_id: SessionId, requested: Role) -> Result<(Session, Participant)> {
        let session = self.store.get_session(session_id).await?;
        if !session.is_active() {
            return Err(CollabError::NotFound(format!("session {session_id}")));
        }
        let role = if session.created_by == self.identity.user_id {
            Role::Facilitator
        } else {
            requested
        };
        let participant = Participant::new(session_id, &self.identity, role);
        if let Err(e) = self.store.upsert_participant(&participant).await {
            log::info!("Join of session {session_id} refused: {e}");
            return Err(e.into());
        }
        Ok((session, participant))
    }

    /// Mark the participant disconnected and end the session when it was
    /// the last one and the session does not outlive its participants.
    pub async fn depart(
        &self,
        session: &Session,
        participant_id: ParticipantId,
        end_empty_sessions: bool,
    ) -> Result<()> {
        self.store
            .mark_participant_disconnected(session.id, participant_id)
            .await?;

        if end_empty_sessions && !session.persist_when_empty {
            let participants = self.store.list_participants(session.id).await?;
            if participants.iter().all(|p| !p.is_connected()) {
                self.store
                    .update_session_status(session.id, SessionStatus::Ended)
                    .await?;
                log::info!("Ended empty session {}", session.id);
            }
        }
        Ok(())
    }

    /// Let `user_id` into a restricted session. Only facilitators invite.
    pub async fn invite(&self, session: &Session, inviter: &Participant, user_id: UserId) -> Result<Invitation> {
        if !inviter.role.can_moderate() {
            return Err(CollabError::Authorization);
        }
        let invitation = Invitation {
            session_id: session.id,
            user_id,
            invited_by: self.identity.user_id,
            created_at: Utc::now(),
        };
        self.store.insert_invitation(&invitation).await?;
        Ok(invitation)
    }

    /// Mark the session ended. Connected clients leave when they see the
    /// change. Only facilitators end sessions.
    pub async fn end(&self, session: &Session, caller: &Participant) -> Result<Session> {
        if !caller.role.can_moderate() {
            return Err(CollabError::Authorization);
        }
        let ended = self
            .store
            .update_session_status(session.id, SessionStatus::Ended)
            .await?;
        log::info!("Session {} ended by {}", session.id, self.identity.display_name);
        Ok(ended)
    }
}
