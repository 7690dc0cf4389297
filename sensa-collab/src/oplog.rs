//! Operation history, pending queue and snapshot bookkeeping.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use sensa_core::MindMap;

use crate::model::{Operation, OperationId, Snapshot, SnapshotId};
use crate::protocol::{ChangeKind, TableChange};

/// Confirmed history plus the local operations awaiting confirmation.
///
/// An operation id appears at most once across history and pending.
#[derive(Debug, Default)]
pub struct OperationLog {
    history: Vec<Operation>,
    pending: Vec<Operation>,
    seen: HashSet<OperationId>,
    ops_since_snapshot: usize,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[Operation] {
        &self.history
    }

    pub fn pending(&self) -> &[Operation] {
        &self.pending
    }

    /// A pending operation by id, for retry.
    pub fn pending_op(&self, id: OperationId) -> Option<&Operation> {
        self.pending.iter().find(|op| op.id == id)
    }

    /// Queue a locally authored operation.
    pub fn stage(&mut self, op: Operation) {
        if self.seen.insert(op.id) {
            self.pending.push(op);
        }
    }

    /// Move a pending operation into history once it has been delivered.
    pub fn confirm(&mut self, id: OperationId) -> Option<&Operation> {
        let index = self.pending.iter().position(|op| op.id == id)?;
        let op = self.pending.remove(index);
        self.history.push(op);
        self.ops_since_snapshot += 1;
        self.history.last()
    }

    /// Drop a pending operation for good.
    pub fn discard(&mut self, id: OperationId) -> Option<Operation> {
        let index = self.pending.iter().position(|op| op.id == id)?;
        let op = self.pending.remove(index);
        self.seen.remove(&id);
        Some(op)
    }

    /// Append an operation received from another client. Duplicates are
    /// ignored; returns whether it was new.
    pub fn receive_remote(&mut self, op: Operation) -> bool {
        if !self.seen.insert(op.id) {
            return false;
        }
        self.history.push(op);
        self.ops_since_snapshot += 1;
        true
    }

    /// Whether any operation was confirmed or received since the last
    /// [`mark_snapshot`](Self::mark_snapshot).
    pub fn has_changes_since_snapshot(&self) -> bool {
        self.ops_since_snapshot > 0
    }

    /// Reset the change counter after a snapshot was saved.
    pub fn mark_snapshot(&mut self) {
        self.ops_since_snapshot = 0;
    }

    /// Fold the confirmed history into a document.
    pub fn replay(&self) -> MindMap {
        MindMap::replay(self.history.iter().map(|op| &op.edit))
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Snapshots of the joined session, most recent first.
#[derive(Debug, Default)]
pub struct SnapshotHistory {
    snapshots: Vec<Snapshot>,
}

impl SnapshotHistory {
    pub fn list(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn get(&self, id: SnapshotId) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    /// Replace the list with a store listing, re-sorted newest first.
    pub fn replace_all(&mut self, mut snapshots: Vec<Snapshot>) {
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.snapshots = snapshots;
    }

    /// Insert keeping most-recent-first order. Returns false for a known id.
    pub fn insert(&mut self, snapshot: Snapshot) -> bool {
        if self.get(snapshot.id).is_some() {
            return false;
        }
        let index = self
            .snapshots
            .iter()
            .position(|s| s.created_at <= snapshot.created_at)
            .unwrap_or(self.snapshots.len());
        self.snapshots.insert(index, snapshot);
        true
    }

    /// Merge one snapshots-table notification.
    pub fn apply_change(&mut self, change: &TableChange) -> bool {
        let snapshot: Snapshot = match change.record_as() {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Ignoring malformed snapshot change: {e}");
                return false;
            }
        };
        match change.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                if let Some(existing) = self.snapshots.iter_mut().find(|s| s.id == snapshot.id) {
                    *existing = snapshot;
                    true
                } else {
                    self.insert(snapshot)
                }
            }
            ChangeKind::Delete => {
                let before = self.snapshots.len();
                self.snapshots.retain(|s| s.id != snapshot.id);
                before != self.snapshots.len()
            }
        }
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}

/// When the next auto-save is due.
#[derive(Debug, Clone)]
pub struct AutoSaveSchedule {
    interval: Duration,
    last_save: Instant,
}

impl AutoSaveSchedule {
    /// Schedule whose clock starts now.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_save: Instant::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Due once the interval has elapsed and something changed since the
    /// last snapshot.
    pub fn is_due(&self, has_changes: bool) -> bool {
        has_changes && self.last_save.elapsed() >= self.interval
    }

    /// Restart the clock after a snapshot.
    pub fn mark_saved(&mut self) {
        self.last_save = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SessionId, UserId};
    use crate::protocol::Table;
    use chrono::Duration as ChronoDuration;
    use sensa_core::{EditOp, MindMapNode};

    fn op(session_id: SessionId, label: &str) -> Operation {
        Operation::new(
            session_id,
            UserId::new(),
            EditOp::NodeAdd {
                node: MindMapNode::new(label),
            },
        )
    }

    #[test]
    fn test_stage_then_confirm() {
        let session = SessionId::new();
        let mut log = OperationLog::new();
        let a = op(session, "a");
        log.stage(a.clone());
        assert_eq!(log.pending().len(), 1);
        assert!(log.history().is_empty());

        assert_eq!(log.confirm(a.id).map(|o| o.id), Some(a.id));
        assert!(log.pending().is_empty());
        assert_eq!(log.history(), &[a.clone()]);
        assert!(log.confirm(a.id).is_none());
    }

    #[test]
    fn test_id_never_in_both_lists() {
        let session = SessionId::new();
        let mut log = OperationLog::new();
        let a = op(session, "a");
        log.stage(a.clone());
        assert!(!log.receive_remote(a.clone()));
        log.stage(a.clone());
        assert_eq!(log.pending().len(), 1);
        log.confirm(a.id);
        assert!(!log.receive_remote(a));
        assert_eq!(log.history().len(), 1);
    }

    #[test]
    fn test_discard_pending() {
        let session = SessionId::new();
        let mut log = OperationLog::new();
        let a = op(session, "a");
        log.stage(a.clone());
        assert_eq!(log.discard(a.id), Some(a.clone()));
        assert!(log.discard(a.id).is_none());
        assert!(log.pending().is_empty());
        assert!(!log.has_changes_since_snapshot());
    }

    #[test]
    fn test_remote_ops_in_arrival_order() {
        let session = SessionId::new();
        let mut log = OperationLog::new();
        let ops: Vec<Operation> = ["a", "b", "c"].iter().map(|l| op(session, l)).collect();
        for o in &ops {
            assert!(log.receive_remote(o.clone()));
        }
        assert_eq!(log.history(), ops.as_slice());
        assert_eq!(log.replay().nodes().len(), 3);
    }

    #[test]
    fn test_snapshot_counter() {
        let session = SessionId::new();
        let mut log = OperationLog::new();
        assert!(!log.has_changes_since_snapshot());
        log.receive_remote(op(session, "a"));
        assert!(log.has_changes_since_snapshot());
        log.mark_snapshot();
        assert!(!log.has_changes_since_snapshot());
    }

    #[test]
    fn test_snapshot_history_most_recent_first() {
        let session = SessionId::new();
        let user = UserId::new();
        let mut older = Snapshot::new(session, user, Some("old".into()), vec![], vec![], false);
        older.created_at -= ChronoDuration::minutes(5);
        let newer = Snapshot::new(session, user, Some("new".into()), vec![], vec![], false);

        let mut history = SnapshotHistory::default();
        assert!(history.insert(older.clone()));
        assert!(history.insert(newer.clone()));
        assert!(!history.insert(newer.clone()));
        let names: Vec<&str> = history.list().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["new", "old"]);

        history.replace_all(vec![older, newer]);
        assert_eq!(history.list()[0].name, "new");
    }

    #[test]
    fn test_snapshot_change_dedupes() {
        let session = SessionId::new();
        let snapshot = Snapshot::new(session, UserId::new(), None, vec![], vec![], true);
        let change = TableChange {
            table: Table::Snapshots,
            kind: ChangeKind::Insert,
            session_id: session,
            record: serde_json::to_value(&snapshot).unwrap(),
        };
        let mut history = SnapshotHistory::default();
        history.insert(snapshot);
        history.apply_change(&change);
        assert_eq!(history.list().len(), 1);
    }

    #[test]
    fn test_auto_save_schedule() {
        let mut schedule = AutoSaveSchedule::new(Duration::from_millis(10));
        assert!(!schedule.is_due(true));
        std::thread::sleep(Duration::from_millis(15));
        assert!(!schedule.is_due(false));
        assert!(schedule.is_due(true));
        schedule.mark_saved();
        assert!(!schedule.is_due(true));
    }
}
