//! Durable snapshot storage.
//!
//! One binary snapshot per document, written with optimistic versioning:
//!
//! ```text
//! read(id)                         → Some({state, version: 4}) | None
//! write_if_version(id, state, 4)   → Written { version: 5 }
//! write_if_version(id, state, 4)   → Conflict { current_version: 5 }
//! ```
//!
//! A missing snapshot has version 0, so the first write expects 0. Two
//! Sessions for the same document can never silently overwrite each
//! other: the loser gets `Conflict`, re-reads, merges and writes again.

pub mod integrity;
pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use tandem_core::DocumentId;

pub use integrity::{ReplayVerifier, SnapshotVerifier, Verdict};
pub use memory::MemoryStore;
pub use rocks::{RocksConfig, RocksStore};

/// A persisted full encode of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub document_id: DocumentId,
    pub encoded_state: Vec<u8>,
    /// Monotonically increasing per document, starting at 1
    pub version: u64,
    /// Milliseconds since the Unix epoch
    pub saved_at: u64,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { version: u64 },
    /// The store holds `current_version`, not the expected one
    Conflict { current_version: u64 },
}

/// Durable key-value store holding one snapshot per document.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn read(&self, document_id: &DocumentId) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Store `encoded_state` if the current version equals
    /// `expected_version`; the new version is `expected_version + 1`.
    async fn write_if_version(
        &self,
        document_id: &DocumentId,
        encoded_state: &[u8],
        expected_version: u64,
    ) -> Result<WriteOutcome, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store could not be reached or refused the operation
    Unavailable(String),
    /// RocksDB internal error
    DatabaseError(String),
    SerializationError(String),
    DeserializationError(String),
    /// A record exists at `version` but its bytes cannot be decoded
    Damaged { version: u64, reason: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Damaged { version, reason } => {
                write!(f, "Snapshot v{version} is damaged: {reason}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
