//! RocksDB-backed durable object store.
//!
//! Column families:
//! - `objects` — one record per Editable Object, keyed by its 16-byte id.
//!   Value: bincode-encoded [`EditableObject`], LZ4 compressed.
//!
//! Presence records are ephemeral and stay in memory.
//!
//! RocksDB has no compare-and-set, so every read-modify-write runs under
//! `write_guard`. This process must be the only writer of the database.

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::LeasePolicy;
use crate::error::StoreError;
use crate::object::{ClientId, EditableObject, ObjectId, ObjectState, PeerInfo};
use crate::presence::PresenceRecord;
use crate::store::memory::{AtomicStoreStats, PresenceTable};
use crate::store::{
    rules, ChangeFeed, CommitOutcome, CommitRequest, DeleteOutcome, LockOutcome, ObjectChange,
    ObjectStore, PresenceFeed, PresenceStore, StoreStats,
};

const CF_OBJECTS: &str = "objects";

/// RocksDB store configuration.
#[derive(Debug, Clone)]
pub struct RocksStoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Change-feed buffer per subscriber.
    pub broadcast_capacity: usize,
    /// Lease TTL and delete policy enforced on every writer.
    pub lease: LeasePolicy,
}

impl Default for RocksStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_sync_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 512,
            broadcast_capacity: 1024,
            lease: LeasePolicy::default(),
        }
    }
}

impl RocksStoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            broadcast_capacity: 256,
            lease: LeasePolicy::default(),
        }
    }
}

/// Durable [`ObjectStore`] with in-memory presence.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksStoreConfig,
    clock: Arc<dyn Clock>,
    write_guard: Mutex<()>,
    changes: broadcast::Sender<ObjectChange>,
    presence: PresenceTable,
    stats: AtomicStoreStats,
}

impl RocksStore {
    /// Open (or create) the database at `config.path`.
    pub fn open(config: RocksStoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);

        let mut cf_opts = Options::default();
        cf_opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 framed.
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.optimize_for_point_lookup(config.block_cache_size as u64);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_OBJECTS, cf_opts)],
        )?;

        let (changes, _) = broadcast::channel(config.broadcast_capacity);
        let presence = PresenceTable::new(config.broadcast_capacity);

        log::info!("Opened object store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            clock,
            write_guard: Mutex::new(()),
            changes,
            presence,
            stats: AtomicStoreStats::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.snapshot()
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_OBJECTS)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_OBJECTS}' not found")))
    }

    fn load(&self, id: ObjectId) -> Result<Option<EditableObject>, StoreError> {
        match self.db.get_cf(self.cf()?, id.as_bytes())? {
            Some(bytes) => decode_record(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, obj: &EditableObject) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(self.cf()?, obj.id.as_bytes(), encode_record(obj)?, &write_opts)?;
        Ok(())
    }

    fn erase(&self, id: ObjectId) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.delete_cf_opt(self.cf()?, id.as_bytes(), &write_opts)?;
        Ok(())
    }

    fn publish(&self, change: ObjectChange) {
        let _ = self.changes.send(change);
    }

    /// Lease read-modify-write; persists and broadcasts only on change.
    fn update_lock<F>(&self, id: ObjectId, op: F) -> Result<LockOutcome, StoreError>
    where
        F: FnOnce(&mut EditableObject) -> LockOutcome,
    {
        let _guard = self.write_guard.lock();
        let Some(mut obj) = self.load(id)? else {
            return Ok(LockOutcome::Missing);
        };
        let before = obj.lock.clone();
        let outcome = op(&mut obj);
        if obj.lock != before {
            self.save(&obj)?;
            self.publish(ObjectChange::LockChanged { id, lock: obj.lock.clone() });
        }
        Ok(outcome)
    }
}

/// Stored value layout: LZ4 (size-prepended) over bincode.
pub fn encode_record(obj: &EditableObject) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(obj, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

pub fn decode_record(bytes: &[u8]) -> Result<EditableObject, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (obj, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(obj)
}

#[async_trait]
impl ObjectStore for RocksStore {
    async fn create(&self, creator: &PeerInfo, state: ObjectState) -> Result<EditableObject, StoreError> {
        let obj = EditableObject::new(Uuid::new_v4(), creator.peer_id, state);
        let _guard = self.write_guard.lock();
        self.save(&obj)?;
        self.publish(ObjectChange::Created(obj.clone()));
        Ok(obj)
    }

    async fn get(&self, id: ObjectId) -> Result<Option<EditableObject>, StoreError> {
        self.load(id)
    }

    async fn list(&self) -> Result<Vec<EditableObject>, StoreError> {
        let mut objects = Vec::new();
        for item in self.db.iterator_cf(self.cf()?, IteratorMode::Start) {
            let (_, value) = item?;
            objects.push(decode_record(&value)?);
        }
        Ok(objects)
    }

    async fn try_lock(&self, id: ObjectId, holder: &PeerInfo) -> Result<LockOutcome, StoreError> {
        let now = self.clock.now_ms();
        let ttl = self.config.lease.ttl();
        let outcome = self.update_lock(id, |obj| rules::try_lock(obj, holder, now, ttl))?;
        self.stats.record_lock(&outcome);
        Ok(outcome)
    }

    async fn renew_lock(&self, id: ObjectId, holder: &PeerInfo) -> Result<LockOutcome, StoreError> {
        let now = self.clock.now_ms();
        let ttl = self.config.lease.ttl();
        self.update_lock(id, |obj| rules::renew_lock(obj, holder, now, ttl))
    }

    async fn unlock(&self, id: ObjectId, holder: ClientId) -> Result<bool, StoreError> {
        let _guard = self.write_guard.lock();
        let Some(mut obj) = self.load(id)? else {
            return Ok(false);
        };
        if !rules::unlock(&mut obj, holder) {
            return Ok(false);
        }
        self.save(&obj)?;
        self.publish(ObjectChange::LockChanged { id, lock: None });
        Ok(true)
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitOutcome, StoreError> {
        let now = self.clock.now_ms();
        let _guard = self.write_guard.lock();
        let outcome = match self.load(request.id)? {
            Some(mut obj) => rules::commit(&mut obj, &request, now),
            None => CommitOutcome::Missing,
        };
        if let CommitOutcome::Committed(obj) = &outcome {
            self.save(obj)?;
            self.publish(ObjectChange::Committed(obj.clone()));
        }
        self.stats.record_commit(&outcome);
        Ok(outcome)
    }

    async fn delete(&self, id: ObjectId, client: ClientId) -> Result<DeleteOutcome, StoreError> {
        let now = self.clock.now_ms();
        let _guard = self.write_guard.lock();
        let Some(obj) = self.load(id)? else {
            return Ok(DeleteOutcome::Missing);
        };
        let outcome = rules::may_delete(&obj, client, self.config.lease.delete_policy, now);
        if outcome == DeleteOutcome::Deleted {
            self.erase(id)?;
            self.publish(ObjectChange::Deleted { id });
        }
        Ok(outcome)
    }

    fn subscribe(&self) -> ChangeFeed {
        self.changes.subscribe()
    }
}

#[async_trait]
impl PresenceStore for RocksStore {
    async fn put_presence(&self, record: PresenceRecord) -> Result<(), StoreError> {
        self.presence.put(record);
        Ok(())
    }

    async fn remove_presence(&self, client_id: ClientId, stale_before: Option<u64>) -> Result<bool, StoreError> {
        Ok(self.presence.remove(client_id, stale_before))
    }

    async fn list_presence(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        Ok(self.presence.list())
    }

    fn subscribe_presence(&self) -> PresenceFeed {
        self.presence.subscribe()
    }
}
