//! RocksDB-backed session store.
//!
//! Column families:
//! - `sessions`     : session records, keyed by session id
//! - `participants` : `<session_id:16><participant_id:16>`
//! - `invitations`  : `<session_id:16><user_id:16>`
//! - `operations`   : `<session_id:16><micros:8 BE><seq:8 BE><operation_id:16>`
//! - `snapshots`    : same layout as operations, LZ4-compressed bodies
//! - `chat_messages`: same layout as operations
//!
//! Records are JSON. Time-ordered keys make a prefix scan return a
//! session's rows oldest first; `seq` keeps insertion order among rows
//! stamped in the same microsecond.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sensa_core::Position;

use super::{check_membership, BackingStore, ChangeFeed, StoreError, StoreResult};
use crate::config::{ConfigError, Validate};
use crate::model::{
    ChatMessage, Invitation, Operation, Participant, ParticipantId, ParticipantStatus, Session,
    SessionId, SessionStatus, Snapshot, SnapshotId, UserId,
};
use crate::protocol::{ChangeKind, Table};

const CF_SESSIONS: &str = "sessions";
const CF_PARTICIPANTS: &str = "participants";
const CF_INVITATIONS: &str = "invitations";
const CF_OPERATIONS: &str = "operations";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_CHAT: &str = "chat_messages";

type Db = DBWithThreadMode<SingleThreaded>;

const COLUMN_FAMILIES: &[&str] = &[
    CF_SESSIONS,
    CF_PARTICIPANTS,
    CF_INVITATIONS,
    CF_OPERATIONS,
    CF_SNAPSHOTS,
    CF_CHAT,
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sensa_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl Validate for StoreConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.block_cache_size == 0 {
            return Err(ConfigError::Zero { field: "block_cache_size" });
        }
        if self.write_buffer_size == 0 {
            return Err(ConfigError::Zero { field: "write_buffer_size" });
        }
        Ok(())
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct RocksStore {
    db: Arc<Db>,
    config: StoreConfig,
    feed: ChangeFeed,
    seq: AtomicU64,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = Db::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened session store at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            config,
            feed: ChangeFeed::default(),
            seq: AtomicU64::new(0),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SESSIONS => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SNAPSHOTS => {
                // Bodies are already LZ4-compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> StoreResult<&rocksdb::ColumnFamily> {
        column(&self.db, name)
    }

    fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let cf = self.cf(cf_name)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(cf, key, value, &write_opts)?;
        Ok(())
    }

    fn put_json<T: Serialize>(&self, cf_name: &str, key: &[u8], record: &T) -> StoreResult<()> {
        self.put(cf_name, key, &encode_json(record)?)
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> StoreResult<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(decode_json(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decode every row under a session prefix, in key order. The scan and
    /// decoding run on the blocking pool.
    async fn scan<T, F>(&self, cf_name: &'static str, session_id: SessionId, decode: F) -> StoreResult<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(&[u8]) -> StoreResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            scan_prefix(&db, cf_name, session_id)?
                .iter()
                .map(|bytes| decode(bytes))
                .collect::<StoreResult<Vec<T>>>()
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("{cf_name} scan aborted: {e}")))?
    }

    fn timed_key(&self, session_id: SessionId, at: chrono::DateTime<chrono::Utc>, id: &Uuid) -> Vec<u8> {
        timed_key(session_id, at, self.seq.fetch_add(1, Ordering::Relaxed), id)
    }

    fn load_session(&self, id: SessionId) -> StoreResult<Session> {
        self.get_json(CF_SESSIONS, id.as_uuid().as_bytes())?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    fn load_participant(&self, session_id: SessionId, id: ParticipantId) -> StoreResult<Option<Participant>> {
        self.get_json(CF_PARTICIPANTS, &pair_key(session_id, id.as_uuid()))
    }
}

fn column<'a>(db: &'a Db, name: &str) -> StoreResult<&'a rocksdb::ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
}

/// Values under a 16-byte session prefix, in key order.
fn scan_prefix(db: &Db, cf_name: &str, session_id: SessionId) -> StoreResult<Vec<Vec<u8>>> {
    let cf = column(db, cf_name)?;
    let prefix = session_id.as_uuid().as_bytes();
    let iter = db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

    let mut values = Vec::new();
    for item in iter {
        let (key, value) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        values.push(value.into_vec());
    }
    Ok(values)
}

fn encode_json<T: Serialize>(record: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn encode_snapshot(snapshot: &Snapshot) -> StoreResult<Vec<u8>> {
    Ok(lz4_flex::compress_prepend_size(&encode_json(snapshot)?))
}

fn decode_snapshot(bytes: &[u8]) -> StoreResult<Snapshot> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    decode_json(&json)
}

/// `<session_id:16><id:16>`
fn pair_key(session_id: SessionId, id: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(session_id.as_uuid().as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

/// `<session_id:16><micros:8 BE><seq:8 BE><id:16>`
fn timed_key(session_id: SessionId, at: chrono::DateTime<chrono::Utc>, seq: u64, id: &Uuid) -> Vec<u8> {
    let micros = at.timestamp_micros().max(0) as u64;
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(session_id.as_uuid().as_bytes());
    key.extend_from_slice(&micros.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

#[async_trait]
impl BackingStore for RocksStore {
    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        self.put_json(CF_SESSIONS, session.id.as_uuid().as_bytes(), session)?;
        self.feed.publish(Table::Sessions, ChangeKind::Insert, session.id, session);
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> StoreResult<Session> {
        self.load_session(id)
    }

    async fn update_session_status(&self, id: SessionId, status: SessionStatus) -> StoreResult<Session> {
        let mut session = self.load_session(id)?;
        session.status = status;
        self.put_json(CF_SESSIONS, id.as_uuid().as_bytes(), &session)?;
        self.feed.publish(Table::Sessions, ChangeKind::Update, id, &session);
        Ok(session)
    }

    async fn insert_invitation(&self, invitation: &Invitation) -> StoreResult<()> {
        self.load_session(invitation.session_id)?;
        let key = pair_key(invitation.session_id, invitation.user_id.as_uuid());
        self.put_json(CF_INVITATIONS, &key, invitation)?;
        self.feed
            .publish(Table::Invitations, ChangeKind::Insert, invitation.session_id, invitation);
        Ok(())
    }

    async fn has_invitation(&self, session_id: SessionId, user_id: UserId) -> StoreResult<bool> {
        let cf = self.cf(CF_INVITATIONS)?;
        Ok(self.db.get_cf(cf, pair_key(session_id, user_id.as_uuid()))?.is_some())
    }

    async fn upsert_participant(&self, participant: &Participant) -> StoreResult<()> {
        let session = self.load_session(participant.session_id)?;
        let invited = self
            .has_invitation(participant.session_id, participant.user_id)
            .await?;
        check_membership(&session, participant, invited)?;

        let kind = match self.load_participant(participant.session_id, participant.id)? {
            Some(_) => ChangeKind::Update,
            None => ChangeKind::Insert,
        };
        let key = pair_key(participant.session_id, participant.id.as_uuid());
        self.put_json(CF_PARTICIPANTS, &key, participant)?;
        self.feed
            .publish(Table::Participants, kind, participant.session_id, participant);
        Ok(())
    }

    async fn mark_participant_disconnected(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> StoreResult<Option<Participant>> {
        let Some(mut participant) = self.load_participant(session_id, participant_id)? else {
            return Ok(None);
        };
        participant.status = ParticipantStatus::Disconnected;
        participant.cursor = None;
        let key = pair_key(session_id, participant_id.as_uuid());
        self.put_json(CF_PARTICIPANTS, &key, &participant)?;
        self.feed
            .publish(Table::Participants, ChangeKind::Update, session_id, &participant);
        Ok(Some(participant))
    }

    async fn update_participant_cursor(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        cursor: Position,
    ) -> StoreResult<Option<Participant>> {
        let Some(mut participant) = self.load_participant(session_id, participant_id)? else {
            return Ok(None);
        };
        if !participant.is_connected() {
            return Ok(None);
        }
        participant.cursor = Some(cursor);
        let key = pair_key(session_id, participant_id.as_uuid());
        self.put_json(CF_PARTICIPANTS, &key, &participant)?;
        self.feed
            .publish(Table::Participants, ChangeKind::Update, session_id, &participant);
        Ok(Some(participant))
    }

    async fn list_participants(&self, session_id: SessionId) -> StoreResult<Vec<Participant>> {
        let mut participants = self
            .scan(CF_PARTICIPANTS, session_id, decode_json::<Participant>)
            .await?;
        participants.sort_by_key(|p| p.joined_at);
        Ok(participants)
    }

    async fn insert_operation(&self, operation: &Operation) -> StoreResult<()> {
        let key = self.timed_key(operation.session_id, operation.timestamp, operation.id.as_uuid());
        self.put_json(CF_OPERATIONS, &key, operation)?;
        self.feed
            .publish(Table::Operations, ChangeKind::Insert, operation.session_id, operation);
        Ok(())
    }

    async fn list_operations(&self, session_id: SessionId) -> StoreResult<Vec<Operation>> {
        self.scan(CF_OPERATIONS, session_id, decode_json::<Operation>).await
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let key = self.timed_key(snapshot.session_id, snapshot.created_at, snapshot.id.as_uuid());
        self.put(CF_SNAPSHOTS, &key, &encode_snapshot(snapshot)?)?;
        self.feed
            .publish(Table::Snapshots, ChangeKind::Insert, snapshot.session_id, snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, session_id: SessionId, id: SnapshotId) -> StoreResult<Snapshot> {
        // Keys are time-ordered, so a lookup by id scans the session's snapshots.
        self.list_snapshots(session_id)
            .await?
            .into_iter()
            .find(|snapshot| snapshot.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("snapshot {id}")))
    }

    async fn list_snapshots(&self, session_id: SessionId) -> StoreResult<Vec<Snapshot>> {
        let mut snapshots = self.scan(CF_SNAPSHOTS, session_id, decode_snapshot).await?;
        snapshots.reverse();
        Ok(snapshots)
    }

    async fn insert_chat_message(&self, message: &ChatMessage) -> StoreResult<()> {
        let key = self.timed_key(message.session_id, message.created_at, message.id.as_uuid());
        self.put_json(CF_CHAT, &key, message)?;
        self.feed
            .publish(Table::ChatMessages, ChangeKind::Insert, message.session_id, message);
        Ok(())
    }

    async fn list_chat_messages(&self, session_id: SessionId) -> StoreResult<Vec<ChatMessage>> {
        self.scan(CF_CHAT, session_id, decode_json::<ChatMessage>).await
    }

    fn changes(&self) -> &ChangeFeed {
        &self.feed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Identity, Role, Visibility};
    use sensa_core::{MindMapEdge, MindMapNode};
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_session_roundtrip() {
        let (_dir, store) = open_temp();
        let ada = Identity::new("Ada");
        let session = Session::new("Genetics", Visibility::Public, ada.user_id);
        store.insert_session(&session).await.unwrap();

        assert_eq!(store.get_session(session.id).await.unwrap(), session);
        assert!(matches!(
            store.get_session(SessionId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_bodies_survive_compression() {
        let (_dir, store) = open_temp();
        let ada = Identity::new("Ada");
        let session_id = SessionId::new();
        let root = MindMapNode::with_id("root", "Genetics").at(0.0, 0.0);
        let child = MindMapNode::with_id("dna", "DNA").child_of(&root).at(120.0, 40.0);
        let edge = MindMapEdge::with_id("e1", "root", "dna").labelled("contains");
        let snapshot = Snapshot::new(
            session_id,
            ada.user_id,
            Some("Before review".into()),
            vec![root, child],
            vec![edge],
            false,
        );

        store.insert_snapshot(&snapshot).await.unwrap();
        let loaded = store.get_snapshot(session_id, snapshot.id).await.unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_scans_are_scoped_by_session() {
        let (_dir, store) = open_temp();
        let ada = Identity::new("Ada");
        let a = SessionId::new();
        let b = SessionId::new();

        for session_id in [a, b, a] {
            let op = Operation::new(
                session_id,
                ada.user_id,
                sensa_core::EditOp::NodeRemove { node_id: "n".into() },
            );
            store.insert_operation(&op).await.unwrap();
        }
        assert_eq!(store.list_operations(a).await.unwrap().len(), 2);
        assert_eq!(store.list_operations(b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_participant_policy_and_disconnect() {
        let (_dir, store) = open_temp();
        let ada = Identity::new("Ada");
        let bob = Identity::new("Bob");
        let session = Session::new("Invite only", Visibility::InviteOnly, ada.user_id);
        store.insert_session(&session).await.unwrap();

        let denied = Participant::new(session.id, &bob, Role::Participant);
        assert_eq!(store.upsert_participant(&denied).await, Err(StoreError::Forbidden));

        let owner = Participant::new(session.id, &ada, Role::Facilitator);
        store.upsert_participant(&owner).await.unwrap();
        let left = store
            .mark_participant_disconnected(session.id, owner.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(left.status, ParticipantStatus::Disconnected);
        assert_eq!(store.list_participants(session.id).await.unwrap(), vec![left]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_scans_on_blocking_pool() {
        let (_dir, store) = open_temp();
        let store = std::sync::Arc::new(store);
        let ada = Identity::new("Ada");
        let session_id = SessionId::new();
        for i in 0..50 {
            let op = Operation::new(
                session_id,
                ada.user_id,
                sensa_core::EditOp::NodeRemove { node_id: format!("n{i}") },
            );
            store.insert_operation(&op).await.unwrap();
        }

        let scans: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.list_operations(session_id).await })
            })
            .collect();
        for scan in scans {
            assert_eq!(scan.await.unwrap().unwrap().len(), 50);
        }
    }

    #[tokio::test]
    async fn test_cursor_kept_until_disconnect() {
        let (_dir, store) = open_temp();
        let ada = Identity::new("Ada");
        let session = Session::new("Anatomy", Visibility::Public, ada.user_id);
        store.insert_session(&session).await.unwrap();
        let owner = Participant::new(session.id, &ada, Role::Facilitator);
        store.upsert_participant(&owner).await.unwrap();

        let moved = store
            .update_participant_cursor(session.id, owner.id, Position::new(12.0, -4.5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.cursor, Some(Position::new(12.0, -4.5)));
        assert_eq!(store.list_participants(session.id).await.unwrap(), vec![moved]);

        store
            .mark_participant_disconnected(session.id, owner.id)
            .await
            .unwrap();
        assert!(store
            .update_participant_cursor(session.id, owner.id, Position::new(1.0, 1.0))
            .await
            .unwrap()
            .is_none());
        assert!(store.list_participants(session.id).await.unwrap()[0].cursor.is_none());
    }

    #[tokio::test]
    async fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let ada = Identity::new("Ada");
        let session = Session::new("Durable", Visibility::Public, ada.user_id);
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.insert_session(&session).await.unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.get_session(session.id).await.unwrap().name, "Durable");
    }

    #[test]
    fn test_timed_keys_sort_by_time() {
        let session_id = SessionId::new();
        let early = chrono::Utc::now();
        let late = early + chrono::Duration::milliseconds(5);
        let a = timed_key(session_id, early, 7, &Uuid::new_v4());
        let b = timed_key(session_id, late, 0, &Uuid::new_v4());
        assert!(a < b);
        // Same instant: sequence decides.
        let c = timed_key(session_id, early, 8, &Uuid::nil());
        assert!(a < c);
        assert!(a.starts_with(session_id.as_uuid().as_bytes()));
    }
}
