//! RocksDB-backed local document store.
//!
//! Column families:
//! - `snapshots` — full document snapshots (bincode record, LZ4 compressed),
//!   keyed by doc_id
//! - `pending`   — updates applied while offline, awaiting remote persistence,
//!   keyed by `<doc_id:16><seq:8 BE>` so a prefix scan yields one document's
//!   queue in arrival order
//!
//! The pending sequence counter is global across documents and recovered by
//! scanning the `pending` CF at open (keys sort by doc id first, so the tail
//! key is not necessarily the highest sequence).

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use uuid::Uuid;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_PENDING: &str = "pending";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_PENDING];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl LocalStoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// A locally persisted document snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Document UUID
    pub doc_id: Uuid,
    /// Application-level entity this document belongs to
    pub entity_id: String,
    /// Full document state (`encode_state_as_update_v1` against empty)
    pub state: Vec<u8>,
    /// Encoded state vector at save time
    pub state_vector: Vec<u8>,
    /// Whether the document is enrolled for offline editing
    pub offline_enabled: bool,
    /// Last local save timestamp (seconds since epoch)
    pub local_updated_at: u64,
    /// Last successful remote persist timestamp, if any
    pub last_persisted_at: Option<u64>,
    /// Uncompressed state size in bytes
    pub state_size: u64,
}

impl SnapshotRecord {
    pub fn new(
        doc_id: Uuid,
        entity_id: impl Into<String>,
        state: Vec<u8>,
        state_vector: Vec<u8>,
    ) -> Self {
        let state_size = state.len() as u64;
        Self {
            doc_id,
            entity_id: entity_id.into(),
            state,
            state_vector,
            offline_enabled: false,
            local_updated_at: epoch_secs(),
            last_persisted_at: None,
            state_size,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, LocalStoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| LocalStoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, LocalStoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| LocalStoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// One queued update awaiting remote persistence.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub seq: u64,
    pub doc_id: Uuid,
    pub update: Vec<u8>,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum LocalStoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for LocalStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DatabaseError(e) => write!(f, "Database error: {e}"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for LocalStoreError {}

impl From<rocksdb::Error> for LocalStoreError {
    fn from(e: rocksdb::Error) -> Self {
        LocalStoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed local store for snapshots and the pending-update queue.
pub struct LocalStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: LocalStoreConfig,
    /// Global sequence number for pending-queue entries
    sequence: AtomicU64,
}

impl LocalStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: LocalStoreConfig) -> Result<Self, LocalStoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    fn cf_options(name: &str, config: &LocalStoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Large values, point lookups; values are LZ4 compressed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_PENDING => {
                // Many small writes, prefix-scanned by doc_id
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    /// Recover the next pending sequence number (max existing + 1).
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_PENDING) else {
            return 0;
        };
        let mut max_seq: Option<u64> = None;
        for item in db.iterator_cf(&cf, IteratorMode::Start) {
            let Ok((key, _)) = item else { continue };
            if key.len() == 24 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[16..24]);
                let seq = u64::from_be_bytes(buf);
                max_seq = Some(max_seq.map_or(seq, |m| m.max(seq)));
            }
        }
        max_seq.map_or(0, |m| m + 1)
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a snapshot record (LZ4 compressed).
    pub fn put_snapshot(&self, record: &SnapshotRecord) -> Result<(), LocalStoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let compressed = lz4_flex::compress_prepend_size(&record.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, record.doc_id.as_bytes(), &compressed, &write_opts)?;
        Ok(())
    }

    /// Load a snapshot record, or `None` if the document has never been saved.
    pub fn get_snapshot(&self, doc_id: Uuid) -> Result<Option<SnapshotRecord>, LocalStoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| LocalStoreError::CompressionError(e.to_string()))?;
                SnapshotRecord::decode(&raw).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Delete a snapshot and the document's pending queue.
    pub fn delete_snapshot(&self, doc_id: Uuid) -> Result<(), LocalStoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf, doc_id.as_bytes());
        self.collect_pending_deletes(doc_id, &mut batch)?;
        self.db.write(batch)?;
        Ok(())
    }

    /// Find the snapshot for an application entity, if any.
    pub fn find_by_entity(&self, entity_id: &str) -> Result<Option<SnapshotRecord>, LocalStoreError> {
        for record in self.scan_snapshots()? {
            if record.entity_id == entity_id {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// All offline-enrolled snapshots.
    pub fn list_offline_enabled(&self) -> Result<Vec<SnapshotRecord>, LocalStoreError> {
        Ok(self
            .scan_snapshots()?
            .into_iter()
            .filter(|r| r.offline_enabled)
            .collect())
    }

    /// Number of offline-enrolled documents.
    pub fn offline_count(&self) -> Result<usize, LocalStoreError> {
        Ok(self.list_offline_enabled()?.len())
    }

    fn scan_snapshots(&self) -> Result<Vec<SnapshotRecord>, LocalStoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| LocalStoreError::DatabaseError(e.to_string()))?;
            let raw = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| LocalStoreError::CompressionError(e.to_string()))?;
            records.push(SnapshotRecord::decode(&raw)?);
        }
        Ok(records)
    }

    // ─── Pending Queue ────────────────────────────────────────────────

    /// Append an update to a document's pending queue. Returns the sequence
    /// number assigned.
    pub fn append_pending(&self, doc_id: Uuid, update: &[u8]) -> Result<u64, LocalStoreError> {
        let cf = self.cf(CF_PENDING)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let key = Self::pending_key(doc_id, seq);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(&cf, key, update, &write_opts)?;
        Ok(seq)
    }

    /// All pending updates for a document, in append order.
    pub fn pending_updates(&self, doc_id: Uuid) -> Result<Vec<PendingUpdate>, LocalStoreError> {
        let cf = self.cf(CF_PENDING)?;
        let start_key = Self::pending_key(doc_id, 0);

        let mut entries = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| LocalStoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&key[16..24]);
            entries.push(PendingUpdate {
                seq: u64::from_be_bytes(buf),
                doc_id,
                update: value.to_vec(),
            });
        }
        Ok(entries)
    }

    /// Number of queued updates for a document.
    pub fn pending_count(&self, doc_id: Uuid) -> Result<usize, LocalStoreError> {
        Ok(self.pending_updates(doc_id)?.len())
    }

    /// Drop a document's entire pending queue (after successful persistence).
    pub fn clear_pending(&self, doc_id: Uuid) -> Result<u64, LocalStoreError> {
        let mut batch = WriteBatch::default();
        let count = self.collect_pending_deletes(doc_id, &mut batch)?;
        if count > 0 {
            self.db.write(batch)?;
        }
        Ok(count)
    }

    fn collect_pending_deletes(
        &self,
        doc_id: Uuid,
        batch: &mut WriteBatch,
    ) -> Result<u64, LocalStoreError> {
        let cf = self.cf(CF_PENDING)?;
        let start_key = Self::pending_key(doc_id, 0);
        let mut count = 0u64;
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| LocalStoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }
        Ok(count)
    }

    /// Force a flush to disk.
    pub fn sync(&self) -> Result<(), LocalStoreError> {
        self.db
            .flush()
            .map_err(|e| LocalStoreError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, LocalStoreError> {
        self.db.cf_handle(name).ok_or_else(|| {
            LocalStoreError::DatabaseError(format!("Column family '{name}' not found"))
        })
    }

    /// Pending key: doc_id (16 bytes) + sequence (8 bytes big-endian).
    fn pending_key(doc_id: Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
