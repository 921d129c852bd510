//! # tandem-core — document identity and the CRDT document contract
//!
//! The sync layer (`tandem-sync`) never touches CRDT internals. It talks to
//! a document only through [`DocumentHandle`]: read a state vector, compute
//! a diff for a peer, apply an update, encode the whole document, and get
//! told when something changed.
//!
//! [`YrsDocument`] is the stock implementation, backed by a `yrs` document
//! holding a single shared text root.

pub mod crdt;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use crdt::YrsDocument;

/// Replica identifier. Matches the CRDT client id of the local document and
/// doubles as the member id on the transport channel.
pub type ClientId = u64;

/// Uniquely addresses one synchronized document instance.
///
/// All peers synchronizing the same logical document must use an identical
/// identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId {
    /// Realtime channel the peers meet on
    pub channel: String,
    pub table: String,
    /// Column holding the encoded snapshot
    pub column: String,
    pub row_id: String,
}

impl DocumentId {
    pub fn new(
        channel: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
        row_id: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            table: table.into(),
            column: column.into(),
            row_id: row_id.into(),
        }
    }

    /// Key of the snapshot row in a persistence store.
    ///
    /// The channel is not part of the key: two channels pointing at the same
    /// row share one snapshot.
    pub fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.table, self.column, self.row_id)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}#{}", self.channel, self.table, self.column, self.row_id)
    }
}

/// Where a document change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    /// Edit made on this replica
    Local,
    /// Update received from a peer
    Remote,
    /// State loaded from a persisted snapshot
    Snapshot,
}

/// Change notification delivered to [`DocumentHandle::on_change`] observers.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// Self-contained update describing the change
    pub update: Vec<u8>,
    pub origin: ChangeOrigin,
}

/// Observer callback for document changes.
pub type ChangeCallback = Box<dyn Fn(DocumentChange) + Send + Sync + 'static>;

/// Keeps a change observer registered. Dropping it unsubscribes.
pub struct ChangeSubscription {
    _inner: Box<dyn Send + Sync>,
}

impl ChangeSubscription {
    pub fn new<T: Send + Sync + 'static>(inner: T) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChangeSubscription")
    }
}

/// Narrow contract between the sync layer and a CRDT document.
///
/// Implementations must be commutative, associative and idempotent under
/// `apply`, and must tag changes with the origin passed to `apply` (local
/// edits made through the implementation's own API are `Local`).
pub trait DocumentHandle: Send + Sync {
    /// CRDT client id of this replica.
    fn client_id(&self) -> ClientId;

    /// Encoded summary of every update this replica has incorporated.
    fn state_vector(&self) -> Vec<u8>;

    /// Update containing everything this replica has that a peer with
    /// `peer_state_vector` lacks. An empty state vector means first contact
    /// and yields the full document.
    fn diff_update(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, DocError>;

    /// Merge an update into the document.
    fn apply(&self, update: &[u8], origin: ChangeOrigin) -> Result<(), DocError>;

    /// Full encode of the document; loading it is equivalent to replaying
    /// every update since creation.
    fn full_encode(&self) -> Vec<u8>;

    /// Register a change observer.
    fn on_change(&self, callback: ChangeCallback) -> Result<ChangeSubscription, DocError>;
}

/// Document errors.
#[derive(Debug, Clone, PartialEq)]
pub enum DocError {
    /// Update or state vector bytes could not be decoded
    Decode(String),
    /// Decoded update could not be integrated
    Apply(String),
    /// Observer registration failed
    Observe(String),
}

impl fmt::Display for DocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocError::Decode(e) => write!(f, "Decode error: {e}"),
            DocError::Apply(e) => write!(f, "Apply error: {e}"),
            DocError::Observe(e) => write!(f, "Observe error: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

impl From<yrs::encoding::read::Error> for DocError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocError::Decode(e.to_string())
    }
}
