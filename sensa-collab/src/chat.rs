//! Session chat log with unread tracking.

use std::collections::HashSet;

use crate::error::{CollabError, Result};
use crate::model::{ChatMessage, MessageId};
use crate::protocol::{ChangeKind, TableChange};

pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Trimmed message content; empty or oversized content is refused.
pub fn validate_content(content: &str) -> Result<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(CollabError::validation("message must not be empty"));
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(CollabError::validation(format!(
            "message longer than {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
    ids: HashSet<MessageId>,
    unread: usize,
    open: bool,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Replace the log with persisted history. History never counts as unread.
    pub fn load_history(&mut self, mut messages: Vec<ChatMessage>) {
        messages.sort_by_key(|m| m.created_at);
        self.ids = messages.iter().map(|m| m.id).collect();
        self.messages = messages;
        self.unread = 0;
    }

    /// Append a message unless its id is already known. While the panel is
    /// closed every new message bumps the unread count.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        self.messages.push(message);
        if !self.open {
            self.unread += 1;
        }
        true
    }

    pub fn apply_change(&mut self, change: &TableChange) -> bool {
        if change.kind != ChangeKind::Insert {
            return false;
        }
        match change.record_as::<ChatMessage>() {
            Ok(message) => self.append(message),
            Err(e) => {
                log::warn!("Ignoring malformed chat message: {e}");
                false
            }
        }
    }

    pub fn open(&mut self) {
        self.open = true;
        self.unread = 0;
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    /// Forget the session's messages. The panel state is a UI preference
    /// and survives.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
        self.unread = 0;
    }
}
