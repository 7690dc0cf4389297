//! The collaboration context: one per open editor.
//!
//! ```text
//!  editor UI ──calls──► CollabContext ──► SessionManager ──► BackingStore
//!      ▲                    │   ▲
//!      │ watch<CollabState> │   │ event pump / presence tick / auto-save
//!      └────────────────────┘   │
//!                    RealtimeTransport ◄── ChannelHandle subscriptions
//! ```
//!
//! State lives in plain state machines behind one mutex that is never held
//! across an `.await`. Every join starts a new epoch; leaving bumps it and
//! aborts the session's tasks, so a call that resumes after a leave sees a
//! stale epoch and changes nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use sensa_core::{EditOp, MindMap, MindMapEdge, MindMapNode, Position};

use crate::chat::{self, ChatLog};
use crate::config::{CollabConfig, Validate};
use crate::error::{CollabError, Result};
use crate::model::{
    ChatMessage, Identity, Invitation, MessageId, Operation, OperationId, Participant, Role,
    Session, SessionId, Snapshot, SnapshotId, Tool, UserId, Viewport, Visibility,
};
use crate::oplog::{AutoSaveSchedule, OperationLog, SnapshotHistory};
use crate::presence::PresenceRoom;
use crate::protocol::{BroadcastMessage, PresenceEvent, Table, TableChange};
use crate::session::{ConnectionStatus, Roster, SessionManager};
use crate::state::CollabState;
use crate::store::BackingStore;
use crate::transport::{ChannelHandle, ChannelStatus, RealtimeTransport, Subscription, TableFilter};

/// Broadcast event name carrying serialized [`Operation`]s.
pub const OPERATION_EVENT: &str = "operation";

const STATUS_STREAM_CAPACITY: usize = 64;

struct Core {
    status: ConnectionStatus,
    session: Option<Session>,
    participant: Option<Participant>,
    channel: Option<ChannelHandle>,
    roster: Roster,
    oplog: OperationLog,
    snapshots: SnapshotHistory,
    chat: ChatLog,
    presence: Option<PresenceRoom>,
    /// Last cursor written to the participant row.
    stored_cursor: Option<Position>,
    auto_save: AutoSaveSchedule,
    tasks: Vec<JoinHandle<()>>,
    error: Option<String>,
}

impl Core {
    fn new(config: &CollabConfig) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            session: None,
            participant: None,
            channel: None,
            roster: Roster::default(),
            oplog: OperationLog::new(),
            snapshots: SnapshotHistory::default(),
            chat: ChatLog::new(),
            presence: None,
            stored_cursor: None,
            auto_save: AutoSaveSchedule::new(config.auto_save_interval()),
            tasks: Vec::new(),
            error: None,
        }
    }

    fn to_state(&self) -> CollabState {
        let (presences, typing_users) = match &self.presence {
            Some(room) => (room.records(), room.typing_users()),
            None => (Vec::new(), Vec::new()),
        };
        CollabState {
            current_session: self.session.clone(),
            local_participant: self.participant.clone(),
            connection_status: self.status,
            participants: self.roster.participants().to_vec(),
            presences,
            typing_users,
            chat_messages: self.chat.messages().to_vec(),
            unread_message_count: self.chat.unread(),
            show_chat: self.chat.is_open(),
            operation_history: self.oplog.history().to_vec(),
            pending_operations: self.oplog.pending().to_vec(),
            snapshots: self.snapshots.list().to_vec(),
            error: self.error.clone(),
        }
    }

    /// Session and participant of a completed join.
    fn membership(&self) -> Result<(Session, Participant)> {
        let joined = matches!(self.status, ConnectionStatus::Connected | ConnectionStatus::Error);
        match (&self.session, &self.participant) {
            (Some(session), Some(participant)) if joined => Ok((session.clone(), participant.clone())),
            _ => Err(CollabError::channel("no session joined")),
        }
    }

    fn channel(&self) -> Result<ChannelHandle> {
        self.membership()?;
        self.channel
            .clone()
            .ok_or_else(|| CollabError::channel("no session joined"))
    }
}

enum PumpEvent {
    Operation(BroadcastMessage),
    Presence(PresenceEvent),
    Participant(TableChange),
    Session(TableChange),
    Snapshot(TableChange),
    Chat(TableChange),
    Status(ChannelStatus),
}

/// Streams the event pump listens on. Created before the initial loads so
/// nothing published in between is lost.
struct ChannelSubscriptions {
    operations: Subscription<BroadcastMessage>,
    presence: Subscription<PresenceEvent>,
    participants: Subscription<TableChange>,
    sessions: Subscription<TableChange>,
    snapshots: Subscription<TableChange>,
    chat: Subscription<TableChange>,
    status: watch::Receiver<ChannelStatus>,
}

impl ChannelSubscriptions {
    fn new(channel: &ChannelHandle) -> Self {
        let session_id = channel.session_id();
        let scoped = |table| TableFilter::table(table).in_session(session_id);
        Self {
            operations: channel.on_broadcast(OPERATION_EVENT),
            presence: channel.on_presence_change(),
            participants: channel.on_table_change(scoped(Table::Participants)),
            sessions: channel.on_table_change(scoped(Table::Sessions)),
            snapshots: channel.on_table_change(scoped(Table::Snapshots)),
            chat: channel.on_table_change(scoped(Table::ChatMessages)),
            status: channel.watch_status(),
        }
    }
}

struct Inner {
    identity: Identity,
    config: CollabConfig,
    transport: Arc<dyn RealtimeTransport>,
    store: Arc<dyn BackingStore>,
    sessions: SessionManager,
    core: Mutex<Core>,
    epoch: AtomicU64,
    state_tx: watch::Sender<CollabState>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    remote_tx: broadcast::Sender<Operation>,
}

impl Inner {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.current_epoch() == epoch
    }

    fn publish(&self, core: &Core) {
        self.state_tx.send_replace(core.to_state());
    }

    /// Move the status machine. Illegal transitions are logged and ignored.
    fn set_status(&self, core: &mut Core, next: ConnectionStatus) -> bool {
        if core.status == next {
            return false;
        }
        if !core.status.can_transition_to(next) {
            log::warn!("Ignoring status change {:?} -> {:?}", core.status, next);
            return false;
        }
        log::debug!("Connection status {:?} -> {:?}", core.status, next);
        core.status = next;
        let _ = self.status_tx.send(next);
        true
    }

    fn update<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let mut core = self.core.lock();
        let result = f(&mut core);
        self.publish(&core);
        result
    }

    /// Apply `f` only if `epoch` is still current.
    fn adopt(&self, epoch: u64, f: impl FnOnce(&mut Core)) -> bool {
        let mut core = self.core.lock();
        if !self.is_current(epoch) {
            return false;
        }
        f(&mut core);
        true
    }

    fn begin_join(&self) -> u64 {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        core.error = None;
        self.set_status(core, ConnectionStatus::Connecting);
        self.publish(core);
        epoch
    }

    async fn join(self: &Arc<Self>, session_id: SessionId, role: Role, epoch: u64) -> Result<Session> {
        let (session, participant) = self.sessions.admit(session_id, role).await?;
        let admitted = self.adopt(epoch, |core| {
            core.session = Some(session.clone());
            core.participant = Some(participant.clone());
        });
        if !admitted {
            self.release(&session, &participant).await;
            return Err(superseded());
        }

        let channel = self.transport.open_channel(session_id).await?;
        if !self.adopt(epoch, |core| core.channel = Some(channel.clone())) {
            self.transport.close_channel(&channel).await;
            return Err(superseded());
        }

        let subscriptions = ChannelSubscriptions::new(&channel);
        let (participants, snapshots, messages) = tokio::try_join!(
            self.store.list_participants(session_id),
            self.store.list_snapshots(session_id),
            self.store.list_chat_messages(session_id),
        )?;

        let mut presence = PresenceRoom::new(
            self.transport.client_id().to_string(),
            &self.identity,
            self.config.cursor_debounce(),
            self.config.presence_liveness(),
        );
        for (key, state) in channel.presence_state() {
            presence.handle_event(&PresenceEvent::Join { key, state });
        }
        self.transport
            .track(&channel, presence.key(), presence.local_state())
            .await?;
        presence.mark_published();

        let mut guard = self.core.lock();
        let core = &mut *guard;
        if !self.is_current(epoch) {
            return Err(superseded());
        }
        core.roster = Roster::new(participants);
        core.snapshots.replace_all(snapshots);
        core.chat.load_history(messages);
        core.presence = Some(presence);
        core.stored_cursor = None;
        core.auto_save = AutoSaveSchedule::new(self.config.auto_save_interval());

        let weak = Arc::downgrade(self);
        core.tasks.push(tokio::spawn(run_event_pump(weak.clone(), epoch, subscriptions)));
        core.tasks.push(tokio::spawn(run_presence_tick(
            weak,
            epoch,
            self.config.presence_tick(),
        )));

        self.set_status(core, ConnectionStatus::Connected);
        self.publish(core);
        log::info!(
            "{} joined session {} as {:?}",
            self.identity.display_name,
            session.id,
            participant.role
        );
        Ok(session)
    }

    /// Undo a failed join if it is still the current one.
    async fn fail_join(&self, epoch: u64, err: &CollabError) {
        let taken = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            if !self.is_current(epoch) {
                return;
            }
            let taken = (
                core.session.take(),
                core.participant.take(),
                core.channel.take(),
                std::mem::take(&mut core.tasks),
            );
            core.presence = None;
            core.error = Some(err.to_string());
            self.set_status(core, ConnectionStatus::Error);
            self.publish(core);
            taken
        };
        log::warn!("Join failed: {err}");

        let (session, participant, channel, tasks) = taken;
        for task in tasks {
            task.abort();
        }
        if let Some(channel) = channel {
            self.transport.close_channel(&channel).await;
        }
        if let (Some(session), Some(participant)) = (session, participant) {
            self.release(&session, &participant).await;
        }
    }

    async fn release(&self, session: &Session, participant: &Participant) {
        if let Err(e) = self.sessions.depart(session, participant.id, false).await {
            log::warn!("Could not release participant {}: {e}", participant.id);
        }
    }

    async fn leave(&self) {
        self.leave_from(None).await;
    }

    /// Leave, or with `Some(epoch)` leave only if that join is still current.
    async fn leave_from(&self, epoch: Option<u64>) {
        let taken = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            if epoch.is_some_and(|e| !self.is_current(e)) {
                return;
            }
            self.epoch.fetch_add(1, Ordering::SeqCst);
            let taken = (
                core.session.take(),
                core.participant.take(),
                core.channel.take(),
                core.presence.take().map(|p| p.key().to_string()),
                std::mem::take(&mut core.tasks),
            );
            core.roster = Roster::default();
            core.oplog.clear();
            core.snapshots.clear();
            core.chat.clear();
            core.error = None;
            self.set_status(core, ConnectionStatus::Disconnected);
            self.publish(core);
            taken
        };

        let (session, participant, channel, presence_key, tasks) = taken;
        for task in tasks {
            task.abort();
        }
        if let Some(channel) = channel {
            if let Some(key) = presence_key {
                if let Err(e) = self.transport.untrack(&channel, &key).await {
                    log::debug!("Untrack on leave failed: {e}");
                }
            }
            self.transport.close_channel(&channel).await;
        }
        if let (Some(session), Some(participant)) = (session, participant) {
            match self
                .sessions
                .depart(&session, participant.id, self.config.end_empty_sessions)
                .await
            {
                Ok(()) => log::info!("{} left session {}", self.identity.display_name, session.id),
                Err(e) => log::warn!("Leaving session {} not recorded: {e}", session.id),
            }
        }
    }

    /// Broadcast a staged operation and settle it.
    async fn submit(&self, epoch: u64, channel: ChannelHandle, op: Operation) -> Result<Operation> {
        let payload = serde_json::to_value(&op).map_err(|e| CollabError::Operation {
            operation_id: op.id,
            reason: e.to_string(),
        })?;
        let sent = self.transport.broadcast(&channel, OPERATION_EVENT, payload).await;

        {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            if !self.is_current(epoch) {
                return Err(superseded());
            }
            match &sent {
                Ok(()) => {
                    core.oplog.confirm(op.id);
                }
                Err(e) => core.error = Some(format!("operation {} not delivered: {e}", op.id)),
            }
            self.publish(core);
        }

        if let Err(e) = sent {
            log::warn!("Operation {} stays pending: {e}", op.id);
            return Err(CollabError::Operation {
                operation_id: op.id,
                reason: e.to_string(),
            });
        }
        log::debug!("Operation {} ({}) delivered", op.id, op.edit.kind_name());

        if self.config.persist_operations {
            if let Err(e) = self.store.insert_operation(&op).await {
                log::warn!("Operation {} not persisted: {e}", op.id);
            }
        }
        Ok(op)
    }

    async fn create_snapshot(
        &self,
        nodes: Vec<MindMapNode>,
        edges: Vec<MindMapEdge>,
        name: Option<String>,
        is_auto_save: bool,
    ) -> Result<Snapshot> {
        let (epoch, session, participant) = {
            let core = self.core.lock();
            let (session, participant) = core.membership()?;
            (self.current_epoch(), session, participant)
        };
        if !participant.role.can_author() {
            return Err(CollabError::Authorization);
        }

        let snapshot = Snapshot::new(session.id, self.identity.user_id, name, nodes, edges, is_auto_save);
        self.store
            .insert_snapshot(&snapshot)
            .await
            .map_err(|e| CollabError::Persistence(e.to_string()))?;

        let mut core = self.core.lock();
        if self.is_current(epoch) {
            core.snapshots.insert(snapshot.clone());
            core.oplog.mark_snapshot();
            core.auto_save.mark_saved();
            self.publish(&core);
        }
        log::info!("Snapshot '{}' saved for session {}", snapshot.name, session.id);
        Ok(snapshot)
    }

    fn auto_save_due(&self) -> Result<bool> {
        let core = self.core.lock();
        let (_, participant) = core.membership()?;
        Ok(participant.role.can_author() && core.auto_save.is_due(core.oplog.has_changes_since_snapshot()))
    }

    async fn auto_save_if_due(&self, nodes: Vec<MindMapNode>, edges: Vec<MindMapEdge>) -> Result<Option<Snapshot>> {
        if !self.auto_save_due()? {
            return Ok(None);
        }
        self.create_snapshot(nodes, edges, None, true).await.map(Some)
    }

    /// Change the local presence record. When `f` returns true the new
    /// record is tracked on the channel.
    async fn change_presence(&self, f: impl FnOnce(&mut PresenceRoom) -> bool) -> Result<()> {
        let publish = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let channel = core.channel()?;
            let presence = core
                .presence
                .as_mut()
                .ok_or_else(|| CollabError::channel("no session joined"))?;
            if f(presence) {
                presence.mark_published();
                Some((channel, presence.key().to_string(), presence.local_state()))
            } else {
                None
            }
        };
        if let Some((channel, key, state)) = publish {
            self.transport.track(&channel, &key, state).await?;
        }
        Ok(())
    }

    /// Prune stale peers, flush a held-back cursor and keep our own record
    /// live. A cursor that moved since the last tick is also written to the
    /// participant row. Returns false once the epoch is stale.
    async fn presence_tick(&self, epoch: u64) -> bool {
        let (publish, store_cursor) = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            if !self.is_current(epoch) {
                return false;
            }
            let Some(presence) = core.presence.as_mut() else {
                return true;
            };
            let pruned = !presence.prune_stale().is_empty();
            let flush = presence.take_pending_cursor() || presence.refresh_due();
            let publish = match (&core.channel, flush) {
                (Some(channel), true) => {
                    presence.mark_published();
                    Some((channel.clone(), presence.key().to_string(), presence.local_state()))
                }
                _ => None,
            };
            let cursor = presence.local().cursor;
            let store_cursor = match (cursor, &core.participant) {
                (Some(cursor), Some(participant)) if core.stored_cursor != Some(cursor) => {
                    core.stored_cursor = Some(cursor);
                    Some((participant.session_id, participant.id, cursor))
                }
                _ => None,
            };
            if pruned {
                self.publish(core);
            }
            (publish, store_cursor)
        };
        if let Some((channel, key, state)) = publish {
            if let Err(e) = self.transport.track(&channel, &key, state).await {
                log::debug!("Presence refresh failed: {e}");
            }
        }
        if let Some((session_id, participant_id, cursor)) = store_cursor {
            if let Err(e) = self
                .store
                .update_participant_cursor(session_id, participant_id, cursor)
                .await
            {
                log::debug!("Cursor not stored: {e}");
                let mut core = self.core.lock();
                if self.is_current(epoch) && core.stored_cursor == Some(cursor) {
                    core.stored_cursor = None;
                }
            }
        }
        true
    }

    /// Fold one channel event into the state. Returns false once the pump
    /// should stop.
    fn handle_event(self: &Arc<Self>, epoch: u64, event: PumpEvent) -> bool {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if !self.is_current(epoch) {
            return false;
        }
        let Some(session_id) = core.session.as_ref().map(|s| s.id) else {
            return false;
        };

        let mut remote_op = None;
        let mut session_ended = false;
        let changed = match event {
            PumpEvent::Operation(msg) => match serde_json::from_value::<Operation>(msg.payload) {
                Ok(op) if op.session_id == session_id => {
                    if core.oplog.receive_remote(op.clone()) {
                        log::debug!("Remote operation {} ({})", op.id, op.edit.kind_name());
                        remote_op = Some(op);
                        true
                    } else {
                        false
                    }
                }
                Ok(op) => {
                    log::warn!("Dropping operation {} for session {}", op.id, op.session_id);
                    false
                }
                Err(e) => {
                    log::warn!("Dropping undecodable operation broadcast: {e}");
                    false
                }
            },
            PumpEvent::Presence(event) => core
                .presence
                .as_mut()
                .is_some_and(|room| room.handle_event(&event)),
            PumpEvent::Participant(change) => {
                let changed = core.roster.apply_change(&change);
                let me = core.participant.as_ref().map(|p| p.id);
                if let Some(updated) = me.and_then(|id| core.roster.get(id)).cloned() {
                    core.participant = Some(updated);
                }
                changed
            }
            PumpEvent::Session(change) => match change.record_as::<Session>() {
                Ok(session) => {
                    session_ended = !session.is_active();
                    core.session = Some(session);
                    true
                }
                Err(e) => {
                    log::warn!("Ignoring malformed session change: {e}");
                    false
                }
            },
            PumpEvent::Snapshot(change) => core.snapshots.apply_change(&change),
            PumpEvent::Chat(change) => core.chat.apply_change(&change),
            PumpEvent::Status(status @ (ChannelStatus::Error | ChannelStatus::Closed)) => {
                log::warn!("Realtime channel for session {session_id} is {status:?}");
                core.error = Some(match status {
                    ChannelStatus::Closed => "realtime channel closed".to_string(),
                    _ => "realtime channel lost".to_string(),
                });
                self.set_status(core, ConnectionStatus::Error);
                true
            }
            PumpEvent::Status(ChannelStatus::Connected) if core.status == ConnectionStatus::Error => {
                log::info!("Realtime channel for session {session_id} recovered");
                core.error = None;
                self.set_status(core, ConnectionStatus::Connecting);
                self.set_status(core, ConnectionStatus::Connected);
                true
            }
            PumpEvent::Status(_) => false,
        };
        if changed {
            self.publish(core);
        }
        drop(guard);

        if let Some(op) = remote_op {
            // No receivers is fine: the editor may not listen.
            let _ = self.remote_tx.send(op);
        }
        if session_ended {
            log::info!("Session {session_id} ended, leaving");
            let inner = self.clone();
            tokio::spawn(async move { inner.leave_from(Some(epoch)).await });
            return false;
        }
        true
    }
}

fn superseded() -> CollabError {
    CollabError::channel("session left while the call was in flight")
}

async fn next_status(rx: &mut watch::Receiver<ChannelStatus>) -> Option<ChannelStatus> {
    rx.changed().await.ok()?;
    let status = *rx.borrow_and_update();
    Some(status)
}

async fn run_event_pump(weak: Weak<Inner>, epoch: u64, mut subs: ChannelSubscriptions) {
    loop {
        let event = tokio::select! {
            Some(msg) = subs.operations.recv() => PumpEvent::Operation(msg),
            Some(event) = subs.presence.recv() => PumpEvent::Presence(event),
            Some(change) = subs.participants.recv() => PumpEvent::Participant(change),
            Some(change) = subs.sessions.recv() => PumpEvent::Session(change),
            Some(change) = subs.snapshots.recv() => PumpEvent::Snapshot(change),
            Some(change) = subs.chat.recv() => PumpEvent::Chat(change),
            Some(status) = next_status(&mut subs.status) => PumpEvent::Status(status),
            else => break,
        };
        let Some(inner) = weak.upgrade() else { break };
        if !inner.handle_event(epoch, event) {
            break;
        }
    }
}

async fn run_presence_tick(weak: Weak<Inner>, epoch: u64, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { break };
        if !inner.presence_tick(epoch).await {
            break;
        }
    }
}

/// Client-side collaboration for one editor instance.
///
/// Owns its background tasks; dropping the context aborts them, but only
/// [`dispose`](Self::dispose) also tells the session the client left.
pub struct CollabContext {
    inner: Arc<Inner>,
}

impl CollabContext {
    /// Fails with [`CollabError::Validation`] when a capacity or timer in
    /// `config` is zero.
    pub fn new(
        identity: Identity,
        transport: Arc<dyn RealtimeTransport>,
        store: Arc<dyn BackingStore>,
        config: CollabConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CollabError::validation(e.to_string()))?;
        let core = Core::new(&config);
        let (state_tx, _) = watch::channel(core.to_state());
        let (status_tx, _) = broadcast::channel(STATUS_STREAM_CAPACITY);
        let (remote_tx, _) = broadcast::channel(config.channel_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                sessions: SessionManager::new(store.clone(), identity.clone()),
                identity,
                config,
                transport,
                store,
                core: Mutex::new(core),
                epoch: AtomicU64::new(0),
                state_tx,
                status_tx,
                remote_tx,
            }),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn config(&self) -> &CollabConfig {
        &self.inner.config
    }

    // ── observation ──────────────────────────────────────────────

    pub fn subscribe(&self) -> watch::Receiver<CollabState> {
        self.inner.state_tx.subscribe()
    }

    pub fn state(&self) -> CollabState {
        self.inner.state_tx.borrow().clone()
    }

    /// Every connection status transition, in order.
    pub fn status_changes(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Operations authored by other clients, as they arrive.
    pub fn remote_operations(&self) -> broadcast::Receiver<Operation> {
        self.inner.remote_tx.subscribe()
    }

    /// The confirmed history folded into a document.
    pub fn replay_history(&self) -> MindMap {
        self.inner.core.lock().oplog.replay()
    }

    // ── sessions ─────────────────────────────────────────────────

    /// Create a session that stays active after everyone left.
    pub async fn create_session(&self, name: &str, visibility: Visibility) -> Result<Session> {
        self.inner.sessions.create(name, visibility, true).await
    }

    pub async fn create_session_with(
        &self,
        name: &str,
        visibility: Visibility,
        persist_when_empty: bool,
    ) -> Result<Session> {
        self.inner.sessions.create(name, visibility, persist_when_empty).await
    }

    /// Join `session_id`, leaving any other session first. Joining the
    /// session we are connected to returns it unchanged.
    pub async fn join_session(&self, session_id: SessionId, role: Role) -> Result<Session> {
        {
            let core = self.inner.core.lock();
            if let (Some(session), ConnectionStatus::Connected) = (&core.session, core.status) {
                if session.id == session_id {
                    return Ok(session.clone());
                }
            }
        }
        let needs_leave = {
            let core = self.inner.core.lock();
            core.session.is_some() || core.status != ConnectionStatus::Disconnected
        };
        if needs_leave {
            self.inner.leave().await;
        }

        let epoch = self.inner.begin_join();
        match self.inner.join(session_id, role, epoch).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.inner.fail_join(epoch, &e).await;
                Err(e)
            }
        }
    }

    pub async fn leave_session(&self) -> Result<()> {
        self.inner.leave().await;
        Ok(())
    }

    pub async fn invite(&self, user_id: UserId) -> Result<Invitation> {
        let (session, participant) = self.inner.core.lock().membership()?;
        self.inner.sessions.invite(&session, &participant, user_id).await
    }

    /// End the current session for everyone, then leave it.
    pub async fn end_session(&self) -> Result<()> {
        let (session, participant) = self.inner.core.lock().membership()?;
        self.inner.sessions.end(&session, &participant).await?;
        self.inner.leave().await;
        Ok(())
    }

    // ── operations ───────────────────────────────────────────────

    pub async fn add_operation(&self, edit: EditOp) -> Result<Operation> {
        let (epoch, channel, op) = {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;
            let channel = core.channel()?;
            let (session, participant) = core.membership()?;
            if !participant.role.can_author() {
                return Err(CollabError::Authorization);
            }
            let op = Operation::new(session.id, self.inner.identity.user_id, edit);
            core.oplog.stage(op.clone());
            self.inner.publish(core);
            (self.inner.current_epoch(), channel, op)
        };
        self.inner.submit(epoch, channel, op).await
    }

    pub async fn retry_operation(&self, id: OperationId) -> Result<Operation> {
        let (epoch, channel, op) = {
            let core = self.inner.core.lock();
            let channel = core.channel()?;
            let op = core
                .oplog
                .pending_op(id)
                .cloned()
                .ok_or_else(|| CollabError::NotFound(format!("pending operation {id}")))?;
            (self.inner.current_epoch(), channel, op)
        };
        log::info!("Retrying operation {id}");
        self.inner.submit(epoch, channel, op).await
    }

    pub fn discard_operation(&self, id: OperationId) -> Result<Operation> {
        self.inner.update(|core| {
            core.oplog
                .discard(id)
                .ok_or_else(|| CollabError::NotFound(format!("pending operation {id}")))
        })
    }

    // ── snapshots ────────────────────────────────────────────────

    pub async fn create_snapshot(
        &self,
        nodes: Vec<MindMapNode>,
        edges: Vec<MindMapEdge>,
        name: Option<String>,
        is_auto_save: bool,
    ) -> Result<Snapshot> {
        self.inner.create_snapshot(nodes, edges, name, is_auto_save).await
    }

    /// Refresh the snapshot list from the store, most recent first.
    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let (epoch, session) = {
            let core = self.inner.core.lock();
            let (session, _) = core.membership()?;
            (self.inner.current_epoch(), session)
        };
        let snapshots = self.inner.store.list_snapshots(session.id).await?;
        let mut core = self.inner.core.lock();
        if self.inner.is_current(epoch) {
            core.snapshots.replace_all(snapshots);
            self.inner.publish(&core);
            Ok(core.snapshots.list().to_vec())
        } else {
            Err(superseded())
        }
    }

    pub async fn get_snapshot(&self, id: SnapshotId) -> Result<Snapshot> {
        let (session, _) = self.inner.core.lock().membership()?;
        Ok(self.inner.store.get_snapshot(session.id, id).await?)
    }

    /// Bring every participant back to a snapshot through a bulk replace.
    pub async fn restore_snapshot(&self, id: SnapshotId) -> Result<Operation> {
        let snapshot = self.get_snapshot(id).await?;
        log::info!("Restoring snapshot '{}'", snapshot.name);
        self.add_operation(EditOp::BulkReplace {
            nodes: snapshot.nodes,
            edges: snapshot.edges,
        })
        .await
    }

    pub async fn auto_save_if_due(
        &self,
        nodes: Vec<MindMapNode>,
        edges: Vec<MindMapEdge>,
    ) -> Result<Option<Snapshot>> {
        self.inner.auto_save_if_due(nodes, edges).await
    }

    /// Check for a due auto-save every interval, reading the document from
    /// `provider` only when one is due. Runs until the session is left.
    pub fn spawn_auto_save<F>(&self, provider: F) -> Result<()>
    where
        F: Fn() -> (Vec<MindMapNode>, Vec<MindMapEdge>) + Send + Sync + 'static,
    {
        let mut core = self.inner.core.lock();
        core.membership()?;
        let epoch = self.inner.current_epoch();
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.auto_save_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.is_current(epoch) {
                    break;
                }
                match inner.auto_save_due() {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(_) => break,
                }
                let (nodes, edges) = provider();
                match inner.auto_save_if_due(nodes, edges).await {
                    Ok(Some(snapshot)) => log::debug!("Auto-saved '{}'", snapshot.name),
                    Ok(None) => {}
                    Err(e) => log::warn!("Auto-save failed: {e}"),
                }
            }
        });
        core.tasks.push(task);
        Ok(())
    }

    // ── presence ─────────────────────────────────────────────────

    pub async fn update_cursor_position(&self, x: f64, y: f64) -> Result<()> {
        self.inner.change_presence(|p| p.update_cursor(x, y)).await
    }

    pub async fn update_typing_status(&self, is_typing: bool) -> Result<()> {
        self.inner.change_presence(|p| p.set_typing(is_typing)).await
    }

    pub async fn update_tool(&self, tool: Tool) -> Result<()> {
        self.inner
            .change_presence(|p| {
                p.set_tool(tool);
                true
            })
            .await
    }

    pub async fn update_viewport(&self, x: f64, y: f64, zoom: f64) -> Result<()> {
        if !(zoom.is_finite() && zoom > 0.0) {
            return Err(CollabError::validation("zoom must be a positive number"));
        }
        self.inner
            .change_presence(|p| {
                p.set_viewport(Viewport { x, y, zoom });
                true
            })
            .await
    }

    // ── chat ─────────────────────────────────────────────────────

    /// Append optimistically, then persist. A failed write keeps the local
    /// copy and returns `Persistence`.
    pub async fn send_chat_message(&self, content: &str, reply_to: Option<MessageId>) -> Result<ChatMessage> {
        let content = chat::validate_content(content)?;
        let message = {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;
            let (session, _) = core.membership()?;
            let message = ChatMessage {
                id: MessageId::new(),
                session_id: session.id,
                sender: self.inner.identity.user_id,
                sender_name: self.inner.identity.display_name.clone(),
                content,
                reply_to,
                created_at: chrono::Utc::now(),
            };
            core.chat.append(message.clone());
            self.inner.publish(core);
            message
        };
        self.inner
            .store
            .insert_chat_message(&message)
            .await
            .map_err(|e| CollabError::Persistence(e.to_string()))?;
        Ok(message)
    }

    pub fn open_chat(&self) {
        self.inner.update(|core| core.chat.open());
    }

    pub fn close_chat(&self) {
        self.inner.update(|core| core.chat.close());
    }

    // ── lifecycle ────────────────────────────────────────────────

    /// Leave the current session. The context stays usable.
    pub async fn dispose(&self) {
        self.inner.leave().await;
    }
}

impl Drop for CollabContext {
    fn drop(&mut self) {
        let mut core = self.inner.core.lock();
        if core.session.is_some() {
            log::debug!("CollabContext dropped while joined; call dispose() to leave cleanly");
        }
        for task in core.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::LocalRealtime;

    fn context(name: &str) -> CollabContext {
        let hub = LocalRealtime::new(64);
        let transport: Arc<dyn RealtimeTransport> = Arc::new(hub.connect());
        let store: Arc<dyn BackingStore> = Arc::new(MemoryStore::new());
        CollabContext::new(Identity::new(name), transport, store, CollabConfig::for_testing()).unwrap()
    }

    #[tokio::test]
    async fn test_zero_sized_config_rejected() {
        let hub = LocalRealtime::new(64);
        let store: Arc<dyn BackingStore> = Arc::new(MemoryStore::new());
        let zero_capacity = CollabConfig {
            channel_capacity: 0,
            ..CollabConfig::for_testing()
        };
        let zero_tick = CollabConfig {
            presence_tick_ms: 0,
            ..CollabConfig::for_testing()
        };
        let zero_auto_save = CollabConfig {
            auto_save_interval_secs: 0,
            ..CollabConfig::for_testing()
        };
        for config in [zero_capacity, zero_tick, zero_auto_save] {
            let result = CollabContext::new(Identity::new("Ada"), Arc::new(hub.connect()), store.clone(), config);
            assert!(matches!(result, Err(CollabError::Validation(msg)) if msg.contains("greater than zero")));
        }
    }

    #[tokio::test]
    async fn test_initial_state() {
        let ctx = context("Ada");
        let state = ctx.state();
        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
        assert!(state.current_session.is_none());
        assert!(!state.show_chat);
    }

    #[tokio::test]
    async fn test_calls_without_session() {
        let ctx = context("Ada");
        assert!(matches!(
            ctx.add_operation(EditOp::NodeRemove { node_id: "n".into() }).await,
            Err(CollabError::Channel(_))
        ));
        assert!(matches!(ctx.send_chat_message("hi", None).await, Err(CollabError::Channel(_))));
        assert!(matches!(ctx.update_cursor_position(1.0, 1.0).await, Err(CollabError::Channel(_))));
        assert!(ctx.spawn_auto_save(|| (Vec::new(), Vec::new())).is_err());
    }

    #[tokio::test]
    async fn test_empty_name_rejected_before_store() {
        let ctx = context("Ada");
        assert!(matches!(
            ctx.create_session("  ", Visibility::Public).await,
            Err(CollabError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_chat_panel_toggles() {
        let ctx = context("Ada");
        ctx.open_chat();
        assert!(ctx.state().show_chat);
        ctx.close_chat();
        assert!(!ctx.state().show_chat);
    }

    #[tokio::test]
    async fn test_join_and_leave_roundtrip() {
        let ctx = context("Ada");
        let session = ctx.create_session("Cells", Visibility::Public).await.unwrap();
        ctx.join_session(session.id, Role::Participant).await.unwrap();

        let state = ctx.state();
        assert!(state.is_connected());
        assert_eq!(state.local_participant.unwrap().role, Role::Facilitator);
        assert_eq!(state.participants.len(), 1);

        ctx.leave_session().await.unwrap();
        let state = ctx.state();
        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
        assert!(state.participants.is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_same_session_is_noop() {
        let ctx = context("Ada");
        let session = ctx.create_session("Cells", Visibility::Public).await.unwrap();
        ctx.join_session(session.id, Role::Participant).await.unwrap();
        let mut statuses = ctx.status_changes();
        ctx.join_session(session.id, Role::Participant).await.unwrap();
        assert!(statuses.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_leave_spares_newer_session() {
        let ctx = context("Ada");
        let first = ctx.create_session("First", Visibility::Public).await.unwrap();
        let second = ctx.create_session("Second", Visibility::Public).await.unwrap();
        ctx.join_session(first.id, Role::Participant).await.unwrap();
        let stale = ctx.inner.current_epoch();

        ctx.join_session(second.id, Role::Participant).await.unwrap();
        ctx.inner.leave_from(Some(stale)).await;
        let state = ctx.state();
        assert!(state.is_connected());
        assert_eq!(state.current_session.unwrap().id, second.id);

        ctx.inner.leave_from(Some(ctx.inner.current_epoch())).await;
        assert_eq!(ctx.state().connection_status, ConnectionStatus::Disconnected);
    }
}
