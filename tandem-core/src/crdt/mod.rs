use crate::{
    ChangeCallback, ChangeOrigin, ChangeSubscription, ClientId, DocError, DocumentChange,
    DocumentHandle,
};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, Origin, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// Name of the shared text root every replica edits
pub const TEXT_ROOT: &str = "content";

const REMOTE_ORIGIN: &str = "tandem:remote";
const SNAPSHOT_ORIGIN: &str = "tandem:snapshot";

/// `yrs`-backed [`DocumentHandle`] holding a single collaborative text.
pub struct YrsDocument {
    doc: Doc,
    text: TextRef,
    client_id: ClientId,
}

impl YrsDocument {
    /// New empty replica with a random client id.
    pub fn new() -> Self {
        // Keep ids inside 32 bits, the range other Yjs peers generate
        let client_id = (uuid::Uuid::new_v4().as_u128() as u64) & 0xFFFF_FFFF;
        Self::with_client_id(client_id.max(1))
    }

    /// New empty replica with a fixed client id. Replicas that edit
    /// concurrently must use distinct ids.
    pub fn with_client_id(client_id: ClientId) -> Self {
        let doc = Doc::with_client_id(client_id.into());
        let text = doc.get_or_insert_text(TEXT_ROOT);
        Self {
            doc,
            text,
            client_id,
        }
    }

    /// Insert `chunk` at character `index`.
    pub fn insert_text(&self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        self.text.insert(&mut txn, index, chunk);
    }

    /// Append `chunk` at the end of the text.
    pub fn push_text(&self, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        self.text.push(&mut txn, chunk);
    }

    pub fn remove_text(&self, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut();
        self.text.remove_range(&mut txn, index, len);
    }

    /// Current text content
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    pub fn text_len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for YrsDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YrsDocument")
            .field("client_id", &self.client_id)
            .finish()
    }
}

fn classify(origin: Option<&Origin>) -> ChangeOrigin {
    match origin {
        Some(o) if *o == Origin::from(REMOTE_ORIGIN) => ChangeOrigin::Remote,
        Some(o) if *o == Origin::from(SNAPSHOT_ORIGIN) => ChangeOrigin::Snapshot,
        _ => ChangeOrigin::Local,
    }
}

impl DocumentHandle for YrsDocument {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn diff_update(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = if peer_state_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(peer_state_vector).map_err(|e| {
                log::warn!("Client {}: undecodable state vector: {e}", self.client_id);
                DocError::from(e)
            })?
        };
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    fn apply(&self, update: &[u8], origin: ChangeOrigin) -> Result<(), DocError> {
        let len = update.len();
        let update = Update::decode_v1(update).map_err(|e| {
            log::warn!("Client {}: undecodable {origin:?} update ({len} bytes): {e}", self.client_id);
            DocError::from(e)
        })?;
        let mut txn = match origin {
            ChangeOrigin::Local => self.doc.transact_mut(),
            ChangeOrigin::Remote => self.doc.transact_mut_with(REMOTE_ORIGIN),
            ChangeOrigin::Snapshot => self.doc.transact_mut_with(SNAPSHOT_ORIGIN),
        };
        txn.apply_update(update).map_err(|e| {
            log::warn!("Client {}: {origin:?} update rejected: {e:?}", self.client_id);
            DocError::Apply(format!("{e:?}"))
        })?;
        log::trace!("Client {}: applied {origin:?} update ({len} bytes)", self.client_id);
        Ok(())
    }

    fn full_encode(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn on_change(&self, callback: ChangeCallback) -> Result<ChangeSubscription, DocError> {
        let sub = self
            .doc
            .observe_update_v1(move |txn, event| {
                callback(DocumentChange {
                    update: event.update.clone(),
                    origin: classify(txn.origin()),
                });
            })
            .map_err(|e| DocError::Observe(format!("{e:?}")))?;
        Ok(ChangeSubscription::new(sub))
    }
}
