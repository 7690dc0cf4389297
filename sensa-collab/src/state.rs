//! Observable state handed to the editor UI.

use serde::Serialize;

use crate::model::{ChatMessage, Operation, Participant, PresenceRecord, Session, Snapshot};
use crate::session::ConnectionStatus;

/// Everything the UI renders about collaboration. Published as a whole on
/// every change through [`CollabContext::subscribe`](crate::CollabContext::subscribe).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollabState {
    pub current_session: Option<Session>,
    /// Our own participant record in the current session.
    pub local_participant: Option<Participant>,
    pub connection_status: ConnectionStatus,
    pub participants: Vec<Participant>,
    /// Other clients' presence records.
    pub presences: Vec<PresenceRecord>,
    pub typing_users: Vec<String>,
    pub chat_messages: Vec<ChatMessage>,
    pub unread_message_count: usize,
    pub show_chat: bool,
    pub operation_history: Vec<Operation>,
    pub pending_operations: Vec<Operation>,
    /// Most recent first.
    pub snapshots: Vec<Snapshot>,
    pub error: Option<String>,
}

impl CollabState {
    pub fn is_connected(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
    }

    pub fn connected_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.is_connected())
    }
}
