//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: room text, LZ4 compressed, keyed by room id
//! - `metadata`: [`SnapshotMetadata`] (bincode), keyed by room id
//!
//! Both are written in one `WriteBatch`, so a snapshot never exists without
//! its metadata.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{DocumentStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("synccode_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-chosen directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub room_id: String,
    /// Number of times the room was persisted
    pub version: u64,
    /// Uncompressed size in bytes
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(room_id: &str) -> Self {
        let now = unix_now();
        Self {
            room_id: room_id.to_string(),
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed [`DocumentStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened snapshot store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4 compressed already.
        opts.set_compression_type(DBCompressionType::None);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Save a snapshot and bump its metadata in one batch.
    pub fn save_snapshot(&self, room_id: &str, text: &str) -> Result<SnapshotMetadata, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(text.as_bytes());

        let mut meta = self
            .load_metadata(room_id)?
            .unwrap_or_else(|| SnapshotMetadata::new(room_id));
        meta.version += 1;
        meta.snapshot_size = text.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, room_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, room_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Persisted room {room_id} v{} ({} → {} bytes)",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    pub fn load_snapshot(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(cf, room_id.as_bytes())? else {
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    pub fn load_metadata(&self, room_id: &str) -> Result<Option<SnapshotMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, room_id.as_bytes())?
            .map(|bytes| SnapshotMetadata::decode(&bytes))
            .transpose()
    }

    /// Remove a room's snapshot and metadata.
    pub fn delete_snapshot(&self, room_id: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SNAPSHOTS)?, room_id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, room_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl DocumentStore for RocksStore {
    fn persist(&self, room_id: &str, snapshot: &str) -> Result<(), StoreError> {
        self.save_snapshot(room_id, snapshot).map(|_| ())
    }

    fn load(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        self.load_snapshot(room_id)
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let room_id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            rooms.push(room_id);
        }
        Ok(rooms)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
