//! The store interface used by the replication engine.

use crate::document::{Change, Document, NewRevision, PutOutcome};
use crate::error::StoreResult;
use bytes::Bytes;
use docsync_protocol::{BlobKey, RevId};
use serde_json::Value;
use tokio::sync::watch;

/// Operations available inside a store transaction.
///
/// Writes staged in a transaction become visible atomically when the
/// transaction closure returns `Ok`, and are discarded when it returns `Err`.
pub trait Transaction {
    /// Returns the current revision of a document, including tombstones.
    fn get(&self, doc_id: &str) -> StoreResult<Option<Document>>;

    /// Returns the body of a specific revision, if the store still has it.
    ///
    /// Stores keep bodies of recent ancestors so they can serve as delta bases.
    fn revision_body(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Option<Value>>;

    /// Writes a local revision on top of the current one.
    ///
    /// Returns the new revision ID.
    fn put(&mut self, doc_id: &str, body: Value, deleted: bool) -> StoreResult<RevId>;

    /// Stores a revision received from a peer.
    ///
    /// Fails with [`crate::StoreError::Conflict`] when the current revision is
    /// not part of the incoming revision's history; the store is unchanged.
    fn put_revision(&mut self, revision: NewRevision) -> StoreResult<PutOutcome>;
}

/// Logical key spaces for raw records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    /// This side's own checkpoint copies.
    Checkpoints,
    /// Checkpoint copies stored on behalf of peers.
    PeerCheckpoints,
}

impl KeySpace {
    /// Returns the key space name.
    pub fn name(&self) -> &'static str {
        match self {
            KeySpace::Checkpoints => "checkpoints",
            KeySpace::PeerCheckpoints => "peerCheckpoints",
        }
    }
}

/// A raw record: an opaque body plus a metadata string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Record body.
    pub body: Vec<u8>,
    /// Metadata (used for checkpoint generation markers).
    pub meta: String,
}

/// A document store.
///
/// Implementations must be safe to share between the application and any
/// number of replicators. Every method is atomic on its own; multi-step
/// document updates go through [`Store::transaction`].
pub trait Store: Send + Sync + 'static {
    /// Runs `f` inside a transaction.
    fn transaction<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut dyn Transaction) -> StoreResult<R>;

    /// Returns the current revision of a document.
    fn get(&self, doc_id: &str) -> StoreResult<Option<Document>> {
        self.transaction(|txn| txn.get(doc_id))
    }

    /// Writes a local revision in its own transaction.
    fn put(&self, doc_id: &str, body: Value) -> StoreResult<RevId> {
        self.transaction(|txn| txn.put(doc_id, body, false))
    }

    /// Deletes a document by writing a tombstone revision.
    fn delete(&self, doc_id: &str) -> StoreResult<RevId> {
        self.transaction(|txn| txn.put(doc_id, Value::Object(Default::default()), true))
    }

    /// Returns all document IDs in sorted order.
    fn doc_ids(&self) -> StoreResult<Vec<String>>;

    /// Enumerates documents lazily in ID order.
    ///
    /// The ID list is captured when called; documents are read as the
    /// iterator advances. Each call starts a fresh enumeration.
    fn enumerate(&self) -> StoreResult<Documents<'_, Self>>
    where
        Self: Sized,
    {
        Ok(Documents {
            store: self,
            ids: self.doc_ids()?.into_iter(),
        })
    }

    /// Lists documents changed after `since`, in sequence order.
    fn changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<Change>>;

    /// Returns the sequence of the latest committed write.
    fn last_sequence(&self) -> u64;

    /// Subscribes to the latest committed sequence.
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Reads a raw record.
    fn raw_get(&self, space: KeySpace, key: &str) -> StoreResult<Option<RawRecord>>;

    /// Writes a raw record unconditionally.
    fn raw_put(&self, space: KeySpace, key: &str, record: RawRecord) -> StoreResult<()>;

    /// Writes a raw record only if the stored metadata equals `expected_meta`
    /// (`None` meaning no record). Returns false if the check failed.
    fn raw_compare_and_put(
        &self,
        space: KeySpace,
        key: &str,
        expected_meta: Option<&str>,
        record: RawRecord,
    ) -> StoreResult<bool>;

    /// Removes a raw record.
    fn raw_delete(&self, space: KeySpace, key: &str) -> StoreResult<()>;

    /// Returns the length of a stored blob.
    fn blob_len(&self, key: &BlobKey) -> StoreResult<Option<u64>>;

    /// Reads up to `length` bytes of a blob starting at `offset`.
    fn read_blob(&self, key: &BlobKey, offset: u64, length: u64) -> StoreResult<Bytes>;

    /// Stores blob content and returns its key.
    fn put_blob(&self, data: Bytes) -> StoreResult<BlobKey>;

    /// Stores blob content under a known key, verifying the content.
    fn install_blob(&self, key: &BlobKey, data: Bytes) -> StoreResult<()>;
}

/// Lazy document enumeration returned by [`Store::enumerate`].
pub struct Documents<'a, S: Store> {
    store: &'a S,
    ids: std::vec::IntoIter<String>,
}

impl<S: Store> Iterator for Documents<'_, S> {
    type Item = StoreResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        for id in self.ids.by_ref() {
            match self.store.get(&id) {
                Ok(Some(doc)) => return Some(Ok(doc)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
