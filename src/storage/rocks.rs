//! RocksDB-backed session store.
//!
//! Column families:
//! - `sessions`: full session snapshots (bincode, LZ4 compressed)
//! - `metadata`: per-document bookkeeping (revision, sizes, timestamps)
//!
//! Snapshot writes batch both column families atomically, so metadata never
//! describes a snapshot that was not written.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{SessionSnapshot, StorageBackend, StoreError};
use crate::types::DocumentId;

const CF_SESSIONS: &str = "sessions";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SESSIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vault_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for tests: small caches, caller-supplied temp directory.
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

/// Bookkeeping stored alongside each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub document_id: DocumentId,
    /// Document revision at the time of the last save
    pub revision: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last save timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl SessionMetadata {
    fn new(document_id: DocumentId) -> Self {
        let now = epoch_secs();
        Self {
            document_id,
            revision: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed snapshot store. Single-threaded RocksDB mode; concurrency
/// comes from tokio, per-document write ordering from `FlushLocks`.
pub struct SessionStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl SessionStore {
    /// Open the store, creating the database and column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        // Sessions are fetched one at a time by document id.
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    /// Save a session snapshot and its metadata in one atomic batch.
    pub fn save_session(
        &self,
        document_id: DocumentId,
        snapshot: &SessionSnapshot,
    ) -> Result<SessionMetadata, StoreError> {
        let cf_sessions = self.cf(CF_SESSIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .metadata(document_id)?
            .unwrap_or_else(|| SessionMetadata::new(document_id));
        meta.revision = snapshot.document.revision;
        meta.snapshot_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = epoch_secs();

        let key = document_id.as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_sessions, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load a session snapshot. `None` if the document was never persisted.
    pub fn load_session(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<SessionSnapshot>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let key = document_id.as_bytes().to_vec();

        let compressed = match self.db.get_cf(&cf, &key)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (snapshot, _) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Some(snapshot))
    }

    pub fn metadata(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<SessionMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let key = document_id.as_bytes().to_vec();
        match self.db.get_cf(&cf, &key)? {
            Some(bytes) => Ok(Some(SessionMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all persisted document ids.
    pub fn list_sessions(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?,
                );
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Delete a session's snapshot and metadata.
    pub fn delete_session(&self, document_id: DocumentId) -> Result<(), StoreError> {
        let cf_sessions = self.cf(CF_SESSIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = document_id.as_bytes().to_vec();

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_sessions, &key);
        batch.delete_cf(&cf_meta, &key);
        self.db.write(batch)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl StorageBackend for SessionStore {
    fn load(&self, document_id: DocumentId) -> Result<Option<SessionSnapshot>, StoreError> {
        self.load_session(document_id)
    }

    fn save(&self, document_id: DocumentId, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        self.save_session(document_id, snapshot)?;
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
