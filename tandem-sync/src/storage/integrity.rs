//! Snapshot verification.
//!
//! After a Session loads (or re-reads) a stored snapshot it asks a
//! [`SnapshotVerifier`] how the stored bytes relate to the live document.
//! The verdict decides what the Session does next:
//!
//! | Verdict    | Meaning                                  | Action            |
//! |------------|------------------------------------------|-------------------|
//! | `Intact`   | stored state equals the live document    | nothing           |
//! | `Stale`    | live document has changes the store lacks| normal save       |
//! | `Diverged` | store has changes the live document lacks| merge, then save  |
//! | `Corrupt`  | stored bytes cannot be replayed          | immediate repair  |

use super::SnapshotRecord;
use tandem_core::{ChangeOrigin, DocumentHandle, YrsDocument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Intact,
    Stale,
    Diverged,
    Corrupt(String),
}

/// Pluggable snapshot check.
pub trait SnapshotVerifier: Send + Sync {
    fn verify(&self, record: &SnapshotRecord, document: &dyn DocumentHandle) -> Verdict;
}

type ScratchFactory = Box<dyn Fn() -> Box<dyn DocumentHandle> + Send + Sync>;

/// Replays the stored snapshot into scratch documents and compares full
/// encodes with the live document.
pub struct ReplayVerifier {
    scratch: ScratchFactory,
}

impl ReplayVerifier {
    /// Verifier using empty [`YrsDocument`]s as scratch space.
    pub fn new() -> Self {
        Self::with_factory(|| Box::new(YrsDocument::with_client_id(0)))
    }

    /// Verifier for a custom document implementation.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn DocumentHandle> + Send + Sync + 'static,
    {
        Self {
            scratch: Box::new(factory),
        }
    }
}

impl Default for ReplayVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotVerifier for ReplayVerifier {
    fn verify(&self, record: &SnapshotRecord, document: &dyn DocumentHandle) -> Verdict {
        if record.encoded_state.is_empty() {
            return Verdict::Corrupt("empty snapshot".into());
        }

        let stored = (self.scratch)();
        if let Err(e) = stored.apply(&record.encoded_state, ChangeOrigin::Snapshot) {
            return Verdict::Corrupt(e.to_string());
        }

        // Does the snapshot carry anything the live document lacks?
        let merged = (self.scratch)();
        let live = document.full_encode();
        if let Err(e) = merged.apply(&live, ChangeOrigin::Snapshot) {
            return Verdict::Corrupt(format!("live document not replayable: {e}"));
        }
        let before = merged.full_encode();
        if merged
            .apply(&record.encoded_state, ChangeOrigin::Snapshot)
            .is_err()
        {
            return Verdict::Corrupt("snapshot conflicts with live document".into());
        }
        if merged.full_encode() != before {
            return Verdict::Diverged;
        }

        if stored.full_encode() == live {
            Verdict::Intact
        } else {
            Verdict::Stale
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::DocumentId;

    fn record(bytes: Vec<u8>) -> SnapshotRecord {
        SnapshotRecord {
            document_id: DocumentId::new("room", "notes", "body", "1"),
            encoded_state: bytes,
            version: 1,
            saved_at: 0,
        }
    }

    #[test]
    fn test_intact() {
        let doc = YrsDocument::with_client_id(1);
        doc.push_text("saved");
        let verdict = ReplayVerifier::new().verify(&record(doc.full_encode()), &doc);
        assert_eq!(verdict, Verdict::Intact);
    }

    #[test]
    fn test_stale() {
        let doc = YrsDocument::with_client_id(1);
        doc.push_text("saved");
        let snapshot = doc.full_encode();
        doc.push_text(" and more");

        let verdict = ReplayVerifier::new().verify(&record(snapshot), &doc);
        assert_eq!(verdict, Verdict::Stale);
    }

    #[test]
    fn test_diverged() {
        let other = YrsDocument::with_client_id(2);
        other.push_text("written elsewhere");
        let doc = YrsDocument::with_client_id(1);
        doc.push_text("local");

        let verdict = ReplayVerifier::new().verify(&record(other.full_encode()), &doc);
        assert_eq!(verdict, Verdict::Diverged);
    }

    #[test]
    fn test_corrupt() {
        let doc = YrsDocument::with_client_id(1);
        let verifier = ReplayVerifier::new();

        assert!(matches!(
            verifier.verify(&record(vec![0xFF, 0xFF, 0xFF]), &doc),
            Verdict::Corrupt(_)
        ));
        assert!(matches!(
            verifier.verify(&record(Vec::new()), &doc),
            Verdict::Corrupt(_)
        ));
    }
}
