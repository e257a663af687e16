//! In-memory document store.

use crate::document::{Change, DocFlags, Document, NewRevision, PutOutcome};
use crate::error::{StoreError, StoreResult};
use crate::store::{KeySpace, RawRecord, Store, Transaction};
use bytes::Bytes;
use docsync_protocol::{body_size, find_blob_refs, BlobKey, RevId};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Default number of ancestor revision IDs kept per document.
pub const DEFAULT_MAX_HISTORY: usize = 100;

#[derive(Debug, Clone)]
struct DocEntry {
    rev_id: RevId,
    history: Vec<RevId>,
    deleted: bool,
    bodies: HashMap<RevId, Value>,
    sequence: u64,
}

impl DocEntry {
    fn new(rev_id: RevId, mut history: Vec<RevId>, deleted: bool, body: Value, max: usize) -> Self {
        history.truncate(max);
        let mut bodies = HashMap::new();
        bodies.insert(rev_id.clone(), body);
        Self {
            rev_id,
            history,
            deleted,
            bodies,
            sequence: 0,
        }
    }

    fn advance(&mut self, rev_id: RevId, history: Vec<RevId>, deleted: bool, body: Value, max: usize) {
        self.history = history;
        self.history.truncate(max);
        self.bodies.insert(rev_id.clone(), body);
        self.rev_id = rev_id;
        self.deleted = deleted;

        let (current, history) = (&self.rev_id, &self.history);
        self.bodies
            .retain(|rev, _| rev == current || history.contains(rev));
    }

    fn body(&self) -> Value {
        self.bodies.get(&self.rev_id).cloned().unwrap_or(Value::Null)
    }

    fn to_document(&self, doc_id: &str) -> Document {
        let body = self.body();
        Document {
            doc_id: doc_id.to_string(),
            rev_id: self.rev_id.clone(),
            history: self.history.clone(),
            flags: DocFlags::for_revision(self.deleted, &body),
            body,
            sequence: self.sequence,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    docs: BTreeMap<String, DocEntry>,
    by_sequence: BTreeMap<u64, String>,
    last_sequence: u64,
    raw: HashMap<(KeySpace, String), RawRecord>,
    blobs: HashMap<BlobKey, Bytes>,
}

impl Inner {
    fn commit(&mut self, staged: BTreeMap<String, DocEntry>) -> bool {
        if staged.is_empty() {
            return false;
        }
        for (doc_id, mut entry) in staged {
            self.last_sequence += 1;
            if let Some(old) = self.docs.get(&doc_id) {
                self.by_sequence.remove(&old.sequence);
            }
            entry.sequence = self.last_sequence;
            self.by_sequence.insert(entry.sequence, doc_id.clone());
            self.docs.insert(doc_id, entry);
        }
        true
    }
}

/// An in-memory [`Store`].
///
/// Transactions are serialized by a single mutex; writes are staged and
/// applied on commit, each assigning a fresh sequence.
///
/// # Example
///
/// ```rust
/// use docsync_store::{MemoryStore, Store};
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// let rev = store.put("doc-1", json!({"name": "a"})).unwrap();
/// assert_eq!(rev.generation(), 1);
/// assert_eq!(store.last_sequence(), 1);
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changes: watch::Sender<u64>,
    contention: AtomicU32,
    max_history: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            changes,
            contention: AtomicU32::new(0),
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    /// Sets how many ancestor revision IDs are kept per document.
    #[must_use]
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    /// Makes the next `count` replicated writes fail with [`StoreError::Busy`].
    pub fn simulate_contention(&self, count: u32) {
        self.contention.store(count, Ordering::SeqCst);
    }

    /// Returns the number of documents, including tombstones.
    pub fn document_count(&self) -> usize {
        self.inner.lock().docs.len()
    }

    /// Returns the number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.inner.lock().blobs.len()
    }
}

impl Store for MemoryStore {
    fn transaction<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut dyn Transaction) -> StoreResult<R>,
    {
        let mut inner = self.inner.lock();
        let (result, staged) = {
            let mut txn = MemoryTransaction {
                inner: &*inner,
                staged: BTreeMap::new(),
                contention: &self.contention,
                max_history: self.max_history,
            };
            let result = f(&mut txn)?;
            (result, txn.staged)
        };
        if inner.commit(staged) {
            let last = inner.last_sequence;
            drop(inner);
            trace!(sequence = last, "committed transaction");
            self.changes.send_replace(last);
        }
        Ok(result)
    }

    fn doc_ids(&self) -> StoreResult<Vec<String>> {
        Ok(self.inner.lock().docs.keys().cloned().collect())
    }

    fn changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<Change>> {
        let inner = self.inner.lock();
        let changes = inner
            .by_sequence
            .range(since.saturating_add(1)..)
            .take(limit)
            .filter_map(|(seq, doc_id)| {
                inner.docs.get(doc_id).map(|entry| Change {
                    sequence: *seq,
                    doc_id: doc_id.clone(),
                    rev_id: entry.rev_id.clone(),
                    deleted: entry.deleted,
                    body_size: body_size(&entry.body()) as u64,
                })
            })
            .collect();
        Ok(changes)
    }

    fn last_sequence(&self) -> u64 {
        self.inner.lock().last_sequence
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn raw_get(&self, space: KeySpace, key: &str) -> StoreResult<Option<RawRecord>> {
        Ok(self.inner.lock().raw.get(&(space, key.to_string())).cloned())
    }

    fn raw_put(&self, space: KeySpace, key: &str, record: RawRecord) -> StoreResult<()> {
        self.inner.lock().raw.insert((space, key.to_string()), record);
        Ok(())
    }

    fn raw_compare_and_put(
        &self,
        space: KeySpace,
        key: &str,
        expected_meta: Option<&str>,
        record: RawRecord,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let slot = (space, key.to_string());
        let current = inner.raw.get(&slot).map(|r| r.meta.as_str());
        if current != expected_meta {
            return Ok(false);
        }
        inner.raw.insert(slot, record);
        Ok(true)
    }

    fn raw_delete(&self, space: KeySpace, key: &str) -> StoreResult<()> {
        self.inner.lock().raw.remove(&(space, key.to_string()));
        Ok(())
    }

    fn blob_len(&self, key: &BlobKey) -> StoreResult<Option<u64>> {
        Ok(self.inner.lock().blobs.get(key).map(|b| b.len() as u64))
    }

    fn read_blob(&self, key: &BlobKey, offset: u64, length: u64) -> StoreResult<Bytes> {
        let inner = self.inner.lock();
        let data = inner
            .blobs
            .get(key)
            .ok_or_else(|| StoreError::MissingBlob(key.clone()))?;
        let size = data.len() as u64;
        if offset > size {
            return Err(StoreError::BlobReadPastEnd {
                key: key.clone(),
                offset,
                size,
            });
        }
        let end = offset.saturating_add(length).min(size);
        Ok(data.slice(offset as usize..end as usize))
    }

    fn put_blob(&self, data: Bytes) -> StoreResult<BlobKey> {
        let key = BlobKey::for_content(&data);
        self.inner.lock().blobs.insert(key.clone(), data);
        Ok(key)
    }

    fn install_blob(&self, key: &BlobKey, data: Bytes) -> StoreResult<()> {
        if !key.matches(&data) {
            return Err(StoreError::CorruptBlob(key.clone()));
        }
        self.inner.lock().blobs.insert(key.clone(), data);
        Ok(())
    }
}

struct MemoryTransaction<'a> {
    inner: &'a Inner,
    staged: BTreeMap<String, DocEntry>,
    contention: &'a AtomicU32,
    max_history: usize,
}

impl MemoryTransaction<'_> {
    fn entry(&self, doc_id: &str) -> Option<&DocEntry> {
        self.staged
            .get(doc_id)
            .or_else(|| self.inner.docs.get(doc_id))
    }

    fn check_blobs(&self, body: &Value) -> StoreResult<()> {
        match find_blob_refs(body)
            .into_iter()
            .find(|r| !self.inner.blobs.contains_key(&r.key))
        {
            Some(missing) => Err(StoreError::MissingBlob(missing.key)),
            None => Ok(()),
        }
    }

    fn take_contention(&self) -> bool {
        self.contention
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&self, doc_id: &str) -> StoreResult<Option<Document>> {
        Ok(self.entry(doc_id).map(|e| e.to_document(doc_id)))
    }

    fn revision_body(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Option<Value>> {
        Ok(self
            .entry(doc_id)
            .and_then(|e| e.bodies.get(rev_id))
            .cloned())
    }

    fn put(&mut self, doc_id: &str, body: Value, deleted: bool) -> StoreResult<RevId> {
        let body = if deleted {
            Value::Object(Default::default())
        } else {
            body
        };
        self.check_blobs(&body)?;

        let max = self.max_history;
        let entry = match self.entry(doc_id).cloned() {
            Some(mut entry) => {
                let rev_id = RevId::compute(Some(&entry.rev_id), deleted, &body);
                let mut history = Vec::with_capacity(entry.history.len() + 1);
                history.push(entry.rev_id.clone());
                history.extend(entry.history.iter().cloned());
                entry.advance(rev_id, history, deleted, body, max);
                entry
            }
            None => {
                let rev_id = RevId::compute(None, deleted, &body);
                DocEntry::new(rev_id, Vec::new(), deleted, body, max)
            }
        };
        let rev_id = entry.rev_id.clone();
        self.staged.insert(doc_id.to_string(), entry);
        Ok(rev_id)
    }

    fn put_revision(&mut self, revision: NewRevision) -> StoreResult<PutOutcome> {
        if self.take_contention() {
            return Err(StoreError::Busy);
        }

        let current = self.entry(&revision.doc_id).cloned();
        if let Some(entry) = &current {
            if entry.rev_id == revision.rev_id || entry.history.contains(&revision.rev_id) {
                return Ok(PutOutcome::AlreadyPresent);
            }
            if !revision.history.contains(&entry.rev_id) {
                debug!(
                    doc_id = %revision.doc_id,
                    local = %entry.rev_id,
                    incoming = %revision.rev_id,
                    "replicated revision conflicts"
                );
                return Err(StoreError::Conflict {
                    doc_id: revision.doc_id,
                    local: entry.rev_id.clone(),
                    incoming: revision.rev_id,
                });
            }
        }
        self.check_blobs(&revision.body)?;

        let max = self.max_history;
        let entry = match current {
            Some(mut entry) => {
                entry.advance(
                    revision.rev_id,
                    revision.history,
                    revision.deleted,
                    revision.body,
                    max,
                );
                entry
            }
            None => DocEntry::new(
                revision.rev_id,
                revision.history,
                revision.deleted,
                revision.body,
                max,
            ),
        };
        self.staged.insert(revision.doc_id, entry);
        Ok(PutOutcome::Inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::blob_reference;
    use proptest::prelude::*;
    use serde_json::json;

    fn replicated(doc: &Document) -> NewRevision {
        NewRevision {
            doc_id: doc.doc_id.clone(),
            rev_id: doc.rev_id.clone(),
            history: doc.history.clone(),
            body: doc.body.clone(),
            deleted: doc.flags.deleted,
        }
    }

    #[test]
    fn local_writes_build_history() {
        let store = MemoryStore::new();
        let r1 = store.put("a", json!({"v": 1})).unwrap();
        let r2 = store.put("a", json!({"v": 2})).unwrap();

        let doc = store.get("a").unwrap().unwrap();
        assert_eq!(doc.rev_id, r2);
        assert_eq!(doc.history, vec![r1.clone()]);
        assert_eq!(r2.generation(), 2);
        assert_eq!(doc.sequence, 2);

        let old = store
            .transaction(|txn| txn.revision_body("a", &r1))
            .unwrap();
        assert_eq!(old, Some(json!({"v": 1})));
    }

    #[test]
    fn failed_transaction_is_discarded() {
        let store = MemoryStore::new();
        let result: StoreResult<()> = store.transaction(|txn| {
            txn.put("a", json!({"v": 1}), false)?;
            Err(StoreError::Busy)
        });
        assert!(result.is_err());
        assert!(store.get("a").unwrap().is_none());
        assert_eq!(store.last_sequence(), 0);
    }

    #[test]
    fn transaction_sees_its_own_writes() {
        let store = MemoryStore::new();
        store
            .transaction(|txn| {
                txn.put("a", json!({"v": 1}), false)?;
                let doc = txn.get("a")?;
                assert!(doc.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn changes_feed_lists_latest_write_once() {
        let store = MemoryStore::new();
        store.put("a", json!({"v": 1})).unwrap();
        store.put("b", json!({"v": 1})).unwrap();
        store.put("a", json!({"v": 2})).unwrap();

        let changes = store.changes_since(0, 100).unwrap();
        let ids: Vec<_> = changes.iter().map(|c| c.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(changes[1].sequence, 3);

        assert_eq!(store.changes_since(2, 100).unwrap().len(), 1);
        assert_eq!(store.changes_since(0, 1).unwrap().len(), 1);
        assert!(store.changes_since(3, 100).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn changes_feed_tracks_latest_writes(
            writes in prop::collection::vec((0usize..6, any::<i32>()), 1..60),
        ) {
            let store = MemoryStore::new();
            for (doc, value) in &writes {
                store.put(&format!("doc-{doc}"), json!({"v": value})).unwrap();
            }

            let changes = store.changes_since(0, usize::MAX).unwrap();
            prop_assert_eq!(store.last_sequence(), writes.len() as u64);
            prop_assert_eq!(changes.len(), store.document_count());
            prop_assert!(changes.windows(2).all(|w| w[0].sequence < w[1].sequence));
            for change in &changes {
                let doc = store.get(&change.doc_id).unwrap().unwrap();
                prop_assert_eq!(&change.rev_id, &doc.rev_id);
                prop_assert_eq!(change.sequence, doc.sequence);
            }
        }
    }

    #[test]
    fn replicated_revision_keeps_its_id() {
        let source = MemoryStore::new();
        source.put("a", json!({"v": 1})).unwrap();
        source.put("a", json!({"v": 2})).unwrap();
        let doc = source.get("a").unwrap().unwrap();

        let target = MemoryStore::new();
        let outcome = target
            .transaction(|txn| txn.put_revision(replicated(&doc)))
            .unwrap();
        assert_eq!(outcome, PutOutcome::Inserted);
        assert_eq!(target.get("a").unwrap().unwrap().rev_id, doc.rev_id);

        let again = target
            .transaction(|txn| txn.put_revision(replicated(&doc)))
            .unwrap();
        assert_eq!(again, PutOutcome::AlreadyPresent);
        assert_eq!(target.last_sequence(), 1);
    }

    #[test]
    fn divergent_revision_conflicts() {
        let source = MemoryStore::new();
        source.put("a", json!({"v": "source"})).unwrap();
        let doc = source.get("a").unwrap().unwrap();

        let target = MemoryStore::new();
        target.put("a", json!({"v": "target"})).unwrap();
        let before = target.get("a").unwrap().unwrap();

        let err = target
            .transaction(|txn| txn.put_revision(replicated(&doc)))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(target.get("a").unwrap().unwrap(), before);
    }

    #[test]
    fn tombstones_replicate() {
        let store = MemoryStore::new();
        store.put("a", json!({"v": 1})).unwrap();
        store.delete("a").unwrap();

        let doc = store.get("a").unwrap().unwrap();
        assert!(doc.is_deleted());
        assert_eq!(doc.body, json!({}));
        assert!(store.changes_since(0, 10).unwrap()[0].deleted);
    }

    #[test]
    fn contention_is_transient() {
        let source = MemoryStore::new();
        source.put("a", json!({})).unwrap();
        let doc = source.get("a").unwrap().unwrap();

        let target = MemoryStore::new();
        target.simulate_contention(1);
        let err = target
            .transaction(|txn| txn.put_revision(replicated(&doc)))
            .unwrap_err();
        assert!(err.is_transient());
        target
            .transaction(|txn| txn.put_revision(replicated(&doc)))
            .unwrap();
    }

    #[test]
    fn blobs_are_verified() {
        let store = MemoryStore::new();
        let key = store.put_blob(Bytes::from_static(b"hello world")).unwrap();
        assert_eq!(store.blob_len(&key).unwrap(), Some(11));
        assert_eq!(&store.read_blob(&key, 6, 100).unwrap()[..], b"world");
        assert!(store.read_blob(&key, 12, 1).is_err());

        let other = MemoryStore::new();
        let bad = other.install_blob(&key, Bytes::from_static(b"tampered"));
        assert_eq!(bad, Err(StoreError::CorruptBlob(key.clone())));
        other
            .install_blob(&key, Bytes::from_static(b"hello world"))
            .unwrap();
        assert_eq!(other.blob_count(), 1);
    }

    #[test]
    fn bodies_need_their_blobs() {
        let store = MemoryStore::new();
        let key = BlobKey::for_content(b"absent");
        let err = store
            .put("a", json!({"file": blob_reference(&key, 6)}))
            .unwrap_err();
        assert_eq!(err, StoreError::MissingBlob(key));
    }

    #[test]
    fn raw_records_compare_and_put() {
        let store = MemoryStore::new();
        let record = |meta: &str| RawRecord {
            body: b"{}".to_vec(),
            meta: meta.to_string(),
        };
        assert!(store
            .raw_compare_and_put(KeySpace::PeerCheckpoints, "cp", None, record("1-cc"))
            .unwrap());
        assert!(!store
            .raw_compare_and_put(KeySpace::PeerCheckpoints, "cp", None, record("1-cc"))
            .unwrap());
        assert!(store
            .raw_compare_and_put(KeySpace::PeerCheckpoints, "cp", Some("1-cc"), record("2-cc"))
            .unwrap());
        assert!(store.raw_get(KeySpace::Checkpoints, "cp").unwrap().is_none());

        store.raw_delete(KeySpace::PeerCheckpoints, "cp").unwrap();
        assert!(store
            .raw_get(KeySpace::PeerCheckpoints, "cp")
            .unwrap()
            .is_none());
    }

    #[test]
    fn enumerate_is_restartable() {
        let store = MemoryStore::new();
        store.put("b", json!({})).unwrap();
        store.put("a", json!({})).unwrap();

        let first: Vec<_> = store
            .enumerate()
            .unwrap()
            .map(|d| d.unwrap().doc_id)
            .collect();
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(store.enumerate().unwrap().count(), 2);
    }

    #[test]
    fn subscribers_see_commits() {
        let store = MemoryStore::new();
        let rx = store.subscribe();
        store.put("a", json!({})).unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let store = MemoryStore::new().with_max_history(2);
        for i in 0..5 {
            store.put("a", json!({"v": i})).unwrap();
        }
        let doc = store.get("a").unwrap().unwrap();
        assert_eq!(doc.history.len(), 2);
        assert_eq!(doc.rev_id.generation(), 5);
    }
}
