//! Presence awareness: who is here, where their cursor is, who is typing.
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! PresenceRoom::update_cursor()   (debounced, trailing value kept)
//!       │
//!       ▼
//! RealtimeTransport::track(key, record)
//!       │
//!       ▼  (relay fan-out)
//! remote PresenceRoom::handle_event()
//!       │
//!       ▼
//! CollabState::presences / typing_users
//! ```
//!
//! Each client tracks exactly one record under its own presence key. Remote
//! records that stop refreshing for longer than the liveness window are
//! pruned locally even if no leave event arrives.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;

use sensa_core::Position;

use crate::model::{Identity, PresenceRecord, Tool, UserId, Viewport};
use crate::protocol::PresenceEvent;

#[derive(Debug, Clone)]
struct RemotePresence {
    record: PresenceRecord,
    last_seen: Instant,
}

/// Local and remote presence for one joined session.
#[derive(Debug)]
pub struct PresenceRoom {
    local: PresenceRecord,
    peers: HashMap<String, RemotePresence>,
    cursor_interval: Duration,
    last_cursor_publish: Option<Instant>,
    /// A cursor move was held back by the debounce and not yet published.
    cursor_pending: bool,
    last_publish: Option<Instant>,
    liveness: Duration,
}

impl PresenceRoom {
    pub fn new(key: impl Into<String>, identity: &Identity, cursor_interval: Duration, liveness: Duration) -> Self {
        Self {
            local: PresenceRecord::new(key, identity),
            peers: HashMap::new(),
            cursor_interval,
            last_cursor_publish: None,
            cursor_pending: false,
            last_publish: None,
            liveness,
        }
    }

    pub fn key(&self) -> &str {
        &self.local.key
    }

    pub fn local(&self) -> &PresenceRecord {
        &self.local
    }

    pub fn local_user_id(&self) -> UserId {
        self.local.user_id
    }

    /// The local record as tracked on the channel.
    pub fn local_state(&self) -> Value {
        serde_json::to_value(&self.local).unwrap_or(Value::Null)
    }

    /// Record a cursor move. Returns `true` when it should be published now;
    /// otherwise the value is held for [`take_pending_cursor`](Self::take_pending_cursor).
    pub fn update_cursor(&mut self, x: f64, y: f64) -> bool {
        self.local.cursor = Some(Position::new(x, y));
        self.local.updated_at = Utc::now();

        let throttled = self
            .last_cursor_publish
            .is_some_and(|at| at.elapsed() < self.cursor_interval);
        if throttled {
            self.cursor_pending = true;
            return false;
        }
        self.last_cursor_publish = Some(Instant::now());
        self.cursor_pending = false;
        true
    }

    /// Release a held-back cursor once the debounce window has passed.
    pub fn take_pending_cursor(&mut self) -> bool {
        if !self.cursor_pending {
            return false;
        }
        if self
            .last_cursor_publish
            .is_some_and(|at| at.elapsed() < self.cursor_interval)
        {
            return false;
        }
        self.last_cursor_publish = Some(Instant::now());
        self.cursor_pending = false;
        true
    }

    /// Returns whether the flag changed.
    pub fn set_typing(&mut self, is_typing: bool) -> bool {
        if self.local.is_typing == is_typing {
            return false;
        }
        self.local.is_typing = is_typing;
        self.local.updated_at = Utc::now();
        true
    }

    pub fn set_tool(&mut self, tool: Tool) {
        self.local.tool = tool;
        self.local.updated_at = Utc::now();
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.local.viewport = Some(viewport);
        self.local.updated_at = Utc::now();
    }

    /// Apply a presence event from the channel. Our own key is ignored.
    /// Returns whether the remote view changed.
    pub fn handle_event(&mut self, event: &PresenceEvent) -> bool {
        if event.key() == self.local.key {
            return false;
        }

        match event {
            PresenceEvent::Join { key, state } | PresenceEvent::Update { key, state } => {
                let mut record: PresenceRecord = match serde_json::from_value(state.clone()) {
                    Ok(record) => record,
                    Err(e) => {
                        log::warn!("Ignoring malformed presence state for {key}: {e}");
                        return false;
                    }
                };
                record.key = key.clone();
                self.peers.insert(
                    key.clone(),
                    RemotePresence {
                        record,
                        last_seen: Instant::now(),
                    },
                );
                true
            }
            PresenceEvent::Leave { key } => self.peers.remove(key).is_some(),
        }
    }

    /// Drop remote records not refreshed within the liveness window.
    pub fn prune_stale(&mut self) -> Vec<String> {
        let liveness = self.liveness;
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > liveness)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            self.peers.remove(key);
            log::debug!("Pruned stale presence {key}");
        }
        stale
    }

    /// Note that the local record was just tracked on the channel.
    pub fn mark_published(&mut self) {
        self.last_publish = Some(Instant::now());
    }

    /// Whether the local record must be re-tracked to stay live for peers.
    pub fn refresh_due(&self) -> bool {
        self.last_publish
            .is_none_or(|at| at.elapsed() >= self.liveness / 2)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, key: &str) -> Option<&PresenceRecord> {
        self.peers.get(key).map(|p| &p.record)
    }

    /// Remote records ordered by display name, then key.
    pub fn records(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self.peers.values().map(|p| p.record.clone()).collect();
        records.sort_by(|a, b| a.display_name.cmp(&b.display_name).then_with(|| a.key.cmp(&b.key)));
        records
    }

    /// Display names of other users currently typing. A user typing in
    /// several tabs appears once; the local user never appears.
    pub fn typing_users(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.record.is_typing && p.record.user_id != self.local.user_id)
            .map(|p| p.record.display_name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn room(interval_ms: u64) -> PresenceRoom {
        PresenceRoom::new(
            "local-key",
            &Identity::new("Ada"),
            Duration::from_millis(interval_ms),
            Duration::from_secs(30),
        )
    }

    fn remote_state(key: &str, name: &str, typing: bool) -> Value {
        let mut record = PresenceRecord::new(key, &Identity::new(name));
        record.is_typing = typing;
        serde_json::to_value(record).unwrap()
    }

    #[test]
    fn test_first_cursor_publishes_immediately() {
        let mut room = room(50);
        assert!(room.update_cursor(1.0, 2.0));
        assert_eq!(room.local().cursor, Some(Position::new(1.0, 2.0)));
    }

    #[test]
    fn test_cursor_debounce_keeps_trailing_value() {
        let mut room = room(30);
        assert!(room.update_cursor(1.0, 1.0));
        assert!(!room.update_cursor(2.0, 2.0));
        assert!(!room.update_cursor(3.0, 3.0));
        assert!(!room.take_pending_cursor());

        thread::sleep(Duration::from_millis(40));
        assert!(room.take_pending_cursor());
        assert_eq!(room.local().cursor, Some(Position::new(3.0, 3.0)));
        assert!(!room.take_pending_cursor());
    }

    #[test]
    fn test_cursor_after_interval() {
        let mut room = room(5);
        assert!(room.update_cursor(1.0, 1.0));
        thread::sleep(Duration::from_millis(10));
        assert!(room.update_cursor(2.0, 2.0));
    }

    #[test]
    fn test_ignores_own_key() {
        let mut room = room(0);
        let event = PresenceEvent::Join {
            key: "local-key".into(),
            state: remote_state("local-key", "Ada", false),
        };
        assert!(!room.handle_event(&event));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_join_update_leave() {
        let mut room = room(0);
        assert!(room.handle_event(&PresenceEvent::Join {
            key: "bob-1".into(),
            state: remote_state("bob-1", "Bob", false),
        }));
        assert!(room.handle_event(&PresenceEvent::Update {
            key: "bob-1".into(),
            state: remote_state("bob-1", "Bob", true),
        }));
        assert_eq!(room.peer_count(), 1);
        assert!(room.peer("bob-1").unwrap().is_typing);

        assert!(room.handle_event(&PresenceEvent::Leave { key: "bob-1".into() }));
        assert!(!room.handle_event(&PresenceEvent::Leave { key: "bob-1".into() }));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_malformed_state_ignored() {
        let mut room = room(0);
        assert!(!room.handle_event(&PresenceEvent::Join {
            key: "x".into(),
            state: json!({ "cursor": "nowhere" }),
        }));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_typing_users_excludes_local_user() {
        let identity = Identity::new("Ada");
        let mut room = PresenceRoom::new("tab-1", &identity, Duration::ZERO, Duration::from_secs(30));

        // Same user in another tab.
        let mut other_tab = PresenceRecord::new("tab-2", &identity);
        other_tab.is_typing = true;
        room.handle_event(&PresenceEvent::Join {
            key: "tab-2".into(),
            state: serde_json::to_value(other_tab).unwrap(),
        });
        room.handle_event(&PresenceEvent::Join {
            key: "bob-1".into(),
            state: remote_state("bob-1", "Bob", true),
        });
        room.handle_event(&PresenceEvent::Join {
            key: "cy-1".into(),
            state: remote_state("cy-1", "Cy", false),
        });

        assert_eq!(room.typing_users(), vec!["Bob".to_string()]);
    }

    #[test]
    fn test_prune_stale_records() {
        let mut room = PresenceRoom::new(
            "local-key",
            &Identity::new("Ada"),
            Duration::ZERO,
            Duration::from_millis(20),
        );
        room.handle_event(&PresenceEvent::Join {
            key: "bob-1".into(),
            state: remote_state("bob-1", "Bob", false),
        });
        assert!(room.prune_stale().is_empty());

        thread::sleep(Duration::from_millis(30));
        assert_eq!(room.prune_stale(), vec!["bob-1".to_string()]);
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_refresh_due_after_half_liveness() {
        let mut room = PresenceRoom::new(
            "local-key",
            &Identity::new("Ada"),
            Duration::ZERO,
            Duration::from_millis(40),
        );
        assert!(room.refresh_due());
        room.mark_published();
        assert!(!room.refresh_due());
        thread::sleep(Duration::from_millis(25));
        assert!(room.refresh_due());
    }

    #[test]
    fn test_set_typing_reports_change() {
        let mut room = room(0);
        assert!(room.set_typing(true));
        assert!(!room.set_typing(true));
        assert!(room.set_typing(false));
    }

    #[test]
    fn test_records_sorted_by_name() {
        let mut room = room(0);
        for (key, name) in [("k1", "Zoe"), ("k2", "Bob")] {
            room.handle_event(&PresenceEvent::Join {
                key: key.into(),
                state: remote_state(key, name, false),
            });
        }
        let names: Vec<String> = room.records().into_iter().map(|r| r.display_name).collect();
        assert_eq!(names, vec!["Bob", "Zoe"]);
    }
}
