//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` — Full document encodes (LZ4 compressed)
//! - `metadata`  — Per-document version and sizes (bincode)
//!
//! Keys are [`DocumentId::storage_key`] bytes. Snapshot and metadata are
//! written in one atomic batch; the version check and the batch run under a
//! process-local lock so the compare-and-swap is atomic for every Session
//! sharing this store.

use super::{now_millis, PersistenceGateway, SnapshotRecord, StoreError, WriteOutcome};
use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tandem_core::DocumentId;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Fsync every snapshot write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl RocksConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Metadata stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub document_id: DocumentId,
    pub version: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Milliseconds since the Unix epoch
    pub saved_at: u64,
}

impl SnapshotMeta {
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

/// RocksDB-backed [`PersistenceGateway`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
    /// Serializes version check + batch write
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
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

        log::info!("Opened snapshot store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_SNAPSHOTS => {
                // Values are already LZ4 framed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    pub fn load_metadata(&self, document_id: &DocumentId) -> Result<Option<SnapshotMeta>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, document_id.storage_key().as_bytes())? {
            Some(bytes) => SnapshotMeta::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn load(&self, document_id: &DocumentId) -> Result<Option<SnapshotRecord>, StoreError> {
        let Some(meta) = self.load_metadata(document_id)? else {
            return Ok(None);
        };
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(cf, document_id.storage_key().as_bytes())? else {
            return Err(StoreError::Damaged {
                version: meta.version,
                reason: "metadata without snapshot".into(),
            });
        };
        let encoded_state =
            lz4_flex::decompress_size_prepended(&compressed).map_err(|e| StoreError::Damaged {
                version: meta.version,
                reason: format!("bad LZ4 frame: {e}"),
            })?;

        Ok(Some(SnapshotRecord {
            document_id: document_id.clone(),
            encoded_state,
            version: meta.version,
            saved_at: meta.saved_at,
        }))
    }

    fn store(
        &self,
        document_id: &DocumentId,
        encoded_state: &[u8],
        expected_version: u64,
    ) -> Result<WriteOutcome, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("write lock poisoned".into()))?;

        let current = self.load_metadata(document_id)?.map_or(0, |m| m.version);
        if current != expected_version {
            return Ok(WriteOutcome::Conflict {
                current_version: current,
            });
        }

        let compressed = lz4_flex::compress_prepend_size(encoded_state);
        let meta = SnapshotMeta {
            document_id: document_id.clone(),
            version: expected_version + 1,
            snapshot_size: encoded_state.len() as u64,
            compressed_size: compressed.len() as u64,
            saved_at: now_millis(),
        };

        let key = document_id.storage_key();
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SNAPSHOTS)?, key.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, key.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Stored snapshot v{} for {document_id} ({} → {} bytes)",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(WriteOutcome::Written {
            version: meta.version,
        })
    }

    /// Every document with a stored snapshot.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            ids.push(SnapshotMeta::decode(&value)?.document_id);
        }
        Ok(ids)
    }

    /// Remove a document's snapshot and metadata.
    pub fn delete(&self, document_id: &DocumentId) -> Result<(), StoreError> {
        let key = document_id.storage_key();
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SNAPSHOTS)?, key.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, key.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Put `bytes` in place of a snapshot's stored frame, as is, keeping its
    /// metadata. For recovery tooling and damage tests.
    pub fn overwrite_raw(&self, document_id: &DocumentId, bytes: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        self.db.put_cf(cf, document_id.storage_key().as_bytes(), bytes)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

#[async_trait]
impl PersistenceGateway for RocksStore {
    async fn read(&self, document_id: &DocumentId) -> Result<Option<SnapshotRecord>, StoreError> {
        self.load(document_id)
    }

    async fn write_if_version(
        &self,
        document_id: &DocumentId,
        encoded_state: &[u8],
        expected_version: u64,
    ) -> Result<WriteOutcome, StoreError> {
        self.store(document_id, encoded_state, expected_version)
    }
}
