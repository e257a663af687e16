//! The receiving half of a direction: answers change offers and stores the
//! revisions that arrive.

use crate::blob::BlobTransferManager;
use crate::checkpoint::SequenceTracker;
use crate::error::{ReplicationError, ReplicationResult};
use crate::events::DocumentEnded;
use crate::session::SessionContext;
use crate::status::Ticket;
use docsync_protocol::{
    apply_delta, ChangeEntry, Direction, RevBody, RevId, RevMessage, RevWant, SyncMessage,
};
use docsync_store::{NewRevision, PutOutcome, Store, StoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct PendingRev {
    ticket: Ticket,
    last_error: Option<ReplicationError>,
}

/// Receives revisions from the peer.
///
/// Every wanted change becomes a document task that ends when its revision
/// is stored, fails for good, or the feed reports caught up without having
/// delivered it. A transient failure leaves the task open, since the sender
/// retries.
pub(crate) struct Puller<S: Store> {
    ctx: Arc<SessionContext<S>>,
    pending: Mutex<HashMap<(String, u64), PendingRev>>,
    tracker: Mutex<Option<SequenceTracker>>,
    caught_up: watch::Sender<bool>,
}

impl<S: Store> Puller<S> {
    pub(crate) fn new(ctx: Arc<SessionContext<S>>) -> Self {
        let (caught_up, _) = watch::channel(false);
        Self {
            ctx,
            pending: Mutex::new(HashMap::new()),
            tracker: Mutex::new(None),
            caught_up,
        }
    }

    /// Starts tracking an active pull from `since`.
    pub(crate) fn begin_pull(&self, since: u64) {
        *self.tracker.lock() = Some(SequenceTracker::new(since));
        self.caught_up.send_replace(false);
        self.ctx.status.lock().set_catching_up(Direction::Pulling, true);
    }

    /// Returns the sequence up to which the pull is durably done.
    pub(crate) fn checkpoint(&self) -> Option<u64> {
        self.tracker.lock().as_ref().map(SequenceTracker::checkpoint)
    }

    /// Resolves once the peer's feed has reported caught up.
    pub(crate) async fn wait_caught_up(&self) {
        let mut rx = self.caught_up.subscribe();
        let _ = rx.wait_for(|caught_up| *caught_up).await;
    }

    /// Answers a `changes` offer.
    pub(crate) fn handle_changes(&self, entries: Vec<ChangeEntry>) -> ReplicationResult<SyncMessage> {
        if entries.is_empty() {
            self.feed_caught_up();
            return Ok(SyncMessage::ChangesReply { wants: vec![] });
        }
        if self.ctx.is_stopping() {
            return Err(ReplicationError::transport_transient("replicator is stopping"));
        }

        let wants = self.ctx.store.transaction(|txn| {
            entries
                .iter()
                .map(|entry| {
                    Ok(match txn.get(&entry.doc_id)? {
                        Some(doc) if doc.knows(&entry.rev_id) => None,
                        Some(doc) => Some(RevWant {
                            known_base: Some(doc.rev_id),
                        }),
                        None => Some(RevWant { known_base: None }),
                    })
                })
                .collect::<StoreResult<Vec<_>>>()
        })?;

        let mut pending = self.pending.lock();
        let mut tracker = self.tracker.lock();
        for (entry, want) in entries.iter().zip(&wants) {
            match want {
                Some(_) => {
                    if let Some(tracker) = tracker.as_mut() {
                        tracker.begin(entry.sequence);
                    }
                    let ticket = self.ctx.status.lock().begin_document(Direction::Pulling);
                    pending.insert(
                        (entry.doc_id.clone(), entry.sequence),
                        PendingRev {
                            ticket,
                            last_error: None,
                        },
                    );
                }
                None => {
                    if let Some(tracker) = tracker.as_mut() {
                        tracker.skip(entry.sequence);
                    }
                }
            }
        }
        debug!(
            offered = entries.len(),
            wanted = wants.iter().filter(|w| w.is_some()).count(),
            "answered change offer"
        );
        Ok(SyncMessage::ChangesReply { wants })
    }

    /// Stores an incoming revision and ends its document task.
    pub(crate) async fn handle_rev(&self, rev: RevMessage) -> ReplicationResult<()> {
        let key = (rev.doc_id.clone(), rev.sequence);
        let result = self.apply(rev).await;
        match &result {
            Ok(()) => self.finish(&key, None),
            Err(e) if e.is_transient() => {
                debug!(doc_id = %key.0, error = %e, "revision failed, awaiting retry");
                if let Some(pending) = self.pending.lock().get_mut(&key) {
                    pending.last_error = Some(e.clone());
                }
            }
            Err(e) => {
                warn!(doc_id = %key.0, error = %e, "revision rejected");
                self.finish(&key, Some(e.clone()));
            }
        }
        result
    }

    async fn apply(&self, rev: RevMessage) -> ReplicationResult<()> {
        let RevMessage {
            doc_id,
            rev_id,
            history,
            deleted,
            sequence: _,
            body,
        } = rev;

        let body = match body {
            RevBody::Full(body) => body,
            RevBody::Delta { base, delta } => {
                let base_body = self
                    .ctx
                    .store
                    .transaction(|txn| txn.revision_body(&doc_id, &base))?
                    .ok_or_else(|| ReplicationError::MissingAncestor {
                        doc_id: doc_id.clone(),
                        base: base.to_string(),
                    })?;
                apply_delta(&base_body, &delta).map_err(|e| ReplicationError::CorruptRevision {
                    doc_id: doc_id.clone(),
                    message: e.to_string(),
                })?
            }
        };

        let expected = RevId::compute(history.first(), deleted, &body);
        if expected != rev_id {
            return Err(ReplicationError::CorruptRevision {
                doc_id,
                message: format!("body does not match revision {rev_id}"),
            });
        }

        BlobTransferManager::new(Arc::clone(&self.ctx))
            .fetch_missing(&doc_id, &body)
            .await?;

        let outcome = self.ctx.store.transaction(|txn| {
            txn.put_revision(NewRevision {
                doc_id: doc_id.clone(),
                rev_id: rev_id.clone(),
                history,
                body,
                deleted,
            })
        })?;
        if outcome == PutOutcome::AlreadyPresent {
            debug!(%doc_id, %rev_id, "revision already present");
        }
        Ok(())
    }

    fn finish(&self, key: &(String, u64), error: Option<ReplicationError>) {
        let Some(pending) = self.pending.lock().remove(key) else {
            debug!(doc_id = %key.0, sequence = key.1, "revision was not requested");
            return;
        };
        self.end(key, pending, error);
    }

    fn end(&self, key: &(String, u64), pending: PendingRev, error: Option<ReplicationError>) {
        let settled = error.as_ref().map_or(true, |e| !e.is_transient());
        if settled {
            if let Some(tracker) = self.tracker.lock().as_mut() {
                tracker.finish(key.1);
            }
        }
        self.ctx.status.lock().end_document(
            pending.ticket,
            DocumentEnded::new(key.0.clone(), Direction::Pulling, error),
        );
    }

    fn feed_caught_up(&self) {
        self.abandon(ReplicationError::transport_transient(
            "peer caught up without sending the revision",
        ));
        if !self.caught_up.send_replace(true) {
            info!("pull caught up");
        }
        self.ctx.status.lock().set_catching_up(Direction::Pulling, false);
    }

    /// Ends every open document task, with its last transient error if it
    /// had one and `error` otherwise.
    pub(crate) fn abandon(&self, error: ReplicationError) {
        let mut open: Vec<_> = self.pending.lock().drain().collect();
        open.sort_by_key(|(key, _)| key.1);
        for (key, mut pending) in open {
            let error = pending.last_error.take().unwrap_or_else(|| error.clone());
            self.end(&key, pending, Some(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicatorOptions;
    use crate::events::ReplicatorEvent;
    use crate::session::tests::context;
    use docsync_protocol::{create_delta, Mode};
    use docsync_store::{Document, MemoryStore, StoreError};
    use serde_json::{json, Value};

    fn entry(doc: &Document, sequence: u64) -> ChangeEntry {
        ChangeEntry {
            sequence,
            doc_id: doc.doc_id.clone(),
            rev_id: doc.rev_id.clone(),
            deleted: doc.flags.deleted,
            body_size: 0,
        }
    }

    fn full(doc: &Document, sequence: u64) -> RevMessage {
        RevMessage {
            doc_id: doc.doc_id.clone(),
            rev_id: doc.rev_id.clone(),
            history: doc.history.clone(),
            deleted: doc.flags.deleted,
            sequence,
            body: RevBody::Full(doc.body.clone()),
        }
    }

    fn source_doc(id: &str, bodies: &[Value]) -> Document {
        let source = MemoryStore::new();
        for body in bodies {
            source.put(id, body.clone()).unwrap();
        }
        source.get(id).unwrap().unwrap()
    }

    fn ended(events: &mut crate::events::EventReceiver) -> Vec<DocumentEnded> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ReplicatorEvent::DocumentEnded(d) = event {
                out.push(d);
            }
        }
        out
    }

    #[tokio::test]
    async fn wants_only_unknown_revisions() {
        let store = Arc::new(MemoryStore::new());
        store.put("known", json!({"n": 1})).unwrap();
        store.put("stale", json!({"n": 1})).unwrap();
        let (ctx, _events, _stop) = context(Arc::clone(&store), ReplicatorOptions::passive());
        let puller = Puller::new(ctx);

        let known = store.get("known").unwrap().unwrap();
        let stale = source_doc("stale", &[json!({"n": 1}), json!({"n": 2})]);
        let fresh = source_doc("fresh", &[json!({"n": 1})]);

        let reply = puller
            .handle_changes(vec![entry(&known, 1), entry(&stale, 2), entry(&fresh, 3)])
            .unwrap();
        let SyncMessage::ChangesReply { wants } = reply else {
            panic!("unexpected {reply:?}");
        };
        assert_eq!(wants[0], None);
        assert_eq!(
            wants[1],
            Some(RevWant {
                known_base: Some(store.get("stale").unwrap().unwrap().rev_id)
            })
        );
        assert_eq!(wants[2], Some(RevWant { known_base: None }));
        assert_eq!(puller.pending.lock().len(), 2);
    }

    #[tokio::test]
    async fn delta_revision_is_reconstructed() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, mut events, _stop) = context(Arc::clone(&store), ReplicatorOptions::passive());
        let puller = Puller::new(ctx);

        let first = source_doc("d", &[json!({"title": "one", "tags": ["a"]})]);
        puller.handle_changes(vec![entry(&first, 1)]).unwrap();
        puller.handle_rev(full(&first, 1)).await.unwrap();

        let second = source_doc(
            "d",
            &[json!({"title": "one", "tags": ["a"]}), json!({"title": "two", "tags": ["a", "b"]})],
        );
        puller.handle_changes(vec![entry(&second, 2)]).unwrap();
        let mut rev = full(&second, 2);
        rev.body = RevBody::Delta {
            base: first.rev_id.clone(),
            delta: create_delta(&first.body, &second.body),
        };
        puller.handle_rev(rev).await.unwrap();

        let stored = store.get("d").unwrap().unwrap();
        assert_eq!(stored.rev_id, second.rev_id);
        assert_eq!(stored.body, second.body);
        let ended = ended(&mut events);
        assert_eq!(ended.len(), 2);
        assert!(ended.iter().all(DocumentEnded::succeeded));
    }

    #[tokio::test]
    async fn delta_against_unknown_base_is_transient() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, mut events, _stop) = context(Arc::clone(&store), ReplicatorOptions::passive());
        let puller = Puller::new(ctx);

        let doc = source_doc("d", &[json!({"v": 1}), json!({"v": 2})]);
        puller.handle_changes(vec![entry(&doc, 4)]).unwrap();
        let mut rev = full(&doc, 4);
        rev.body = RevBody::Delta {
            base: doc.history[0].clone(),
            delta: json!({"v": 2}),
        };

        let err = puller.handle_rev(rev).await.unwrap_err();
        assert!(matches!(err, ReplicationError::MissingAncestor { .. }));
        assert!(err.is_transient());
        assert!(ended(&mut events).is_empty());

        // The sender falls back to the full body.
        puller.handle_rev(full(&doc, 4)).await.unwrap();
        assert_eq!(store.get("d").unwrap().unwrap().rev_id, doc.rev_id);
        assert_eq!(ended(&mut events).len(), 1);
    }

    #[tokio::test]
    async fn tampered_body_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, mut events, _stop) = context(Arc::clone(&store), ReplicatorOptions::passive());
        let puller = Puller::new(ctx);

        let doc = source_doc("d", &[json!({"v": 1})]);
        puller.handle_changes(vec![entry(&doc, 1)]).unwrap();
        let mut rev = full(&doc, 1);
        rev.body = RevBody::Full(json!({"v": 666}));

        let err = puller.handle_rev(rev).await.unwrap_err();
        assert!(matches!(err, ReplicationError::CorruptRevision { .. }));
        assert!(store.get("d").unwrap().is_none());
        let ended = ended(&mut events);
        assert_eq!(ended.len(), 1);
        assert!(!ended[0].transient);
    }

    #[tokio::test]
    async fn conflicting_revision_leaves_store_unchanged() {
        let store = Arc::new(MemoryStore::new());
        store.put("d", json!({"mine": true})).unwrap();
        let before = store.get("d").unwrap().unwrap();
        let (ctx, _events, _stop) = context(Arc::clone(&store), ReplicatorOptions::passive());
        let puller = Puller::new(ctx);

        let theirs = source_doc("d", &[json!({"theirs": true})]);
        puller.handle_changes(vec![entry(&theirs, 1)]).unwrap();
        let err = puller.handle_rev(full(&theirs, 1)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Store(StoreError::Conflict { .. })));
        assert!(err.is_conflict());
        assert_eq!(store.get("d").unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn caught_up_ends_undelivered_tasks() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, mut events, _stop) = context(Arc::clone(&store), ReplicatorOptions::pulling(Mode::OneShot));
        let puller = Puller::new(ctx);
        puller.begin_pull(0);

        let doc = source_doc("d", &[json!({"v": 1})]);
        puller.handle_changes(vec![entry(&doc, 1)]).unwrap();
        puller.handle_changes(vec![]).unwrap();
        puller.wait_caught_up().await;

        let ended = ended(&mut events);
        assert_eq!(ended.len(), 1);
        assert!(ended[0].transient);
        assert_eq!(puller.checkpoint(), Some(0));
    }

    #[tokio::test]
    async fn offers_are_refused_while_stopping() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, _events, stop) = context(Arc::clone(&store), ReplicatorOptions::passive());
        let puller = Puller::new(ctx);
        stop.send_replace(true);

        let doc = source_doc("d", &[json!({"v": 1})]);
        let err = puller.handle_changes(vec![entry(&doc, 1)]).unwrap_err();
        assert!(err.is_transient());
    }
}
