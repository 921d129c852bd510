//! In-memory persistence gateway with fault injection.

use super::{now_millis, PersistenceGateway, SnapshotRecord, StoreError, WriteOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tandem_core::DocumentId;

/// Snapshot store kept in process memory, keyed by
/// [`DocumentId::storage_key`].
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, SnapshotRecord>>,
    writes: AtomicU64,
    write_attempts: AtomicU64,
    fail_writes: AtomicUsize,
    fail_reads: AtomicUsize,
    conflict_writes: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail as if the store were unreachable.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` writes lose a race: another writer persists first
    /// (bumping the version) and the write reports a conflict.
    pub fn conflict_next_writes(&self, n: usize) {
        self.conflict_writes.store(n, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Write calls so far, including failed and conflicting ones.
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn record(&self, document_id: &DocumentId) -> Option<SnapshotRecord> {
        self.records
            .lock()
            .ok()
            .and_then(|r| r.get(&document_id.storage_key()).cloned())
    }

    /// Seed a snapshot directly, bypassing version checks.
    pub fn insert(&self, document_id: &DocumentId, encoded_state: Vec<u8>, version: u64) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(
                document_id.storage_key(),
                SnapshotRecord {
                    document_id: document_id.clone(),
                    encoded_state,
                    version,
                    saved_at: now_millis(),
                },
            );
        }
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn read(&self, document_id: &DocumentId) -> Result<Option<SnapshotRecord>, StoreError> {
        if take_one(&self.fail_reads) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        Ok(self.record(document_id))
    }

    async fn write_if_version(
        &self,
        document_id: &DocumentId,
        encoded_state: &[u8],
        expected_version: u64,
    ) -> Result<WriteOutcome, StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.fail_writes) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }

        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))?;
        let key = document_id.storage_key();

        if take_one(&self.conflict_writes) {
            let bumped = records.get(&key).map_or(1, |r| r.version + 1);
            let state = records
                .get(&key)
                .map(|r| r.encoded_state.clone())
                .unwrap_or_else(|| encoded_state.to_vec());
            records.insert(
                key,
                SnapshotRecord {
                    document_id: document_id.clone(),
                    encoded_state: state,
                    version: bumped,
                    saved_at: now_millis(),
                },
            );
            return Ok(WriteOutcome::Conflict {
                current_version: bumped,
            });
        }

        let current = records.get(&key).map_or(0, |r| r.version);
        if current != expected_version {
            return Ok(WriteOutcome::Conflict {
                current_version: current,
            });
        }

        let version = expected_version + 1;
        records.insert(
            key,
            SnapshotRecord {
                document_id: document_id.clone(),
                encoded_state: encoded_state.to_vec(),
                version,
                saved_at: now_millis(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(WriteOutcome::Written { version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_id() -> DocumentId {
        DocumentId::new("room", "notes", "body", "1")
    }

    #[tokio::test]
    async fn test_read_missing() {
        let store = MemoryStore::new();
        assert_eq!(store.read(&doc_id()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_versions_increase() {
        let store = MemoryStore::new();
        let id = doc_id();

        assert_eq!(
            store.write_if_version(&id, b"one", 0).await.unwrap(),
            WriteOutcome::Written { version: 1 }
        );
        assert_eq!(
            store.write_if_version(&id, b"two", 1).await.unwrap(),
            WriteOutcome::Written { version: 2 }
        );

        let record = store.read(&id).await.unwrap().unwrap();
        assert_eq!(record.encoded_state, b"two");
        assert_eq!(record.version, 2);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_expected_version_conflicts() {
        let store = MemoryStore::new();
        let id = doc_id();
        store.write_if_version(&id, b"one", 0).await.unwrap();

        assert_eq!(
            store.write_if_version(&id, b"late", 0).await.unwrap(),
            WriteOutcome::Conflict { current_version: 1 }
        );
        assert_eq!(store.read(&id).await.unwrap().unwrap().encoded_state, b"one");
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryStore::new();
        let id = doc_id();

        store.fail_next_writes(1);
        assert!(store.write_if_version(&id, b"x", 0).await.is_err());

        store.conflict_next_writes(1);
        assert_eq!(
            store.write_if_version(&id, b"x", 0).await.unwrap(),
            WriteOutcome::Conflict { current_version: 1 }
        );
        assert_eq!(
            store.write_if_version(&id, b"y", 1).await.unwrap(),
            WriteOutcome::Written { version: 2 }
        );
        assert_eq!(store.write_attempts(), 3);
        assert_eq!(store.write_count(), 1);

        store.fail_next_reads(1);
        assert!(store.read(&id).await.is_err());
        assert!(store.read(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_channel_does_not_split_storage() {
        let store = MemoryStore::new();
        let a = DocumentId::new("room-a", "notes", "body", "1");
        let b = DocumentId::new("room-b", "notes", "body", "1");

        store.write_if_version(&a, b"shared", 0).await.unwrap();
        assert_eq!(store.read(&b).await.unwrap().unwrap().version, 1);
    }
}
