//! The sending half of a direction: offers local changes and sends the
//! revisions the peer asks for.

use crate::checkpoint::SequenceTracker;
use crate::error::{ReplicationError, ReplicationResult, CODE_MISSING_ANCESTOR};
use crate::events::DocumentEnded;
use crate::session::SessionContext;
use crate::status::Ticket;
use docsync_protocol::{
    body_size, create_delta, ChangeEntry, Direction, RevBody, RevId, RevMessage, RevWant,
    SyncMessage,
};
use docsync_store::{Change, Document, Store};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Decides which changes are offered.
///
/// Deletions bypass the property filter, so the peer learns that a document
/// it already has went away even though its tombstone carries no properties.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChangeFilter {
    doc_ids: Option<BTreeSet<String>>,
    params: BTreeMap<String, String>,
}

impl ChangeFilter {
    pub(crate) fn new(doc_ids: Option<Vec<String>>, params: BTreeMap<String, String>) -> Self {
        Self {
            doc_ids: doc_ids.map(|ids| ids.into_iter().collect()),
            params,
        }
    }

    fn admits_id(&self, doc_id: &str) -> bool {
        self.doc_ids.as_ref().map_or(true, |ids| ids.contains(doc_id))
    }

    fn admits_body(&self, body: &Value) -> bool {
        self.params.iter().all(|(key, expected)| match body.get(key) {
            Some(Value::String(actual)) => actual == expected,
            Some(other) => other.to_string() == *expected,
            None => false,
        })
    }

    fn admits<S: Store>(&self, store: &S, change: &Change) -> ReplicationResult<bool> {
        if !self.admits_id(&change.doc_id) {
            return Ok(false);
        }
        if self.params.is_empty() || change.deleted {
            return Ok(true);
        }
        Ok(store
            .get(&change.doc_id)?
            .is_some_and(|doc| self.admits_body(&doc.body)))
    }
}

/// Picks the encoding of a revision body.
///
/// A delta is used only when the peer named a base that is in the document's
/// history, its body is still available and the body is large enough.
/// Tombstones are always sent whole.
pub(crate) fn encode_body(
    doc: &Document,
    base: Option<&RevId>,
    base_body: Option<&Value>,
    min_size_for_delta: usize,
) -> RevBody {
    match (base, base_body) {
        (Some(base), Some(base_body))
            if !doc.is_deleted()
                && doc.knows(base)
                && body_size(&doc.body) >= min_size_for_delta =>
        {
            RevBody::Delta {
                base: base.clone(),
                delta: create_delta(base_body, &doc.body),
            }
        }
        _ => RevBody::Full(doc.body.clone()),
    }
}

/// Trims the history sent with a revision.
///
/// Keeps at most `max` ancestors, but never cuts before the peer's current
/// revision, so the peer can still find it in the ancestry.
pub(crate) fn trim_history(
    mut history: Vec<RevId>,
    peer_rev: Option<&RevId>,
    max: usize,
) -> Vec<RevId> {
    let keep = peer_rev
        .and_then(|rev| history.iter().position(|r| r == rev))
        .map_or(max, |index| max.max(index + 1));
    history.truncate(keep);
    history
}

/// Feeds local changes to the peer.
pub(crate) struct Pusher<S: Store> {
    ctx: Arc<SessionContext<S>>,
    since: u64,
    continuous: bool,
    filter: ChangeFilter,
    tracker: Option<Arc<Mutex<SequenceTracker>>>,
}

impl<S: Store> Pusher<S> {
    pub(crate) fn new(
        ctx: Arc<SessionContext<S>>,
        since: u64,
        continuous: bool,
        filter: ChangeFilter,
        tracker: Option<Arc<Mutex<SequenceTracker>>>,
    ) -> Self {
        Self {
            ctx,
            since,
            continuous,
            filter,
            tracker,
        }
    }

    /// Offers changes until caught up, then keeps following the store when
    /// continuous.
    pub(crate) async fn run(mut self) -> ReplicationResult<()> {
        let ctx = Arc::clone(&self.ctx);
        let mut changes = ctx.store.subscribe();
        let mut stop = ctx.stop.clone();
        let semaphore = Arc::new(Semaphore::new(ctx.options.max_in_flight));
        let mut caught_up = false;
        ctx.status.lock().set_catching_up(Direction::Pushing, true);

        let result = loop {
            changes.borrow_and_update();
            let drained = self.drain(&semaphore).await;
            if ctx.conn.is_closed() {
                break drained.and(Err(ReplicationError::Disconnected));
            }
            // Sent even after a failed drain, so the peer closes out documents
            // it is still waiting for.
            if let Err(e) = drained.and(self.mark_caught_up().await) {
                break Err(e);
            }
            if !caught_up {
                caught_up = true;
                info!(sequence = self.since, "push caught up");
                ctx.status.lock().set_catching_up(Direction::Pushing, false);
            }
            if !self.continuous || *stop.borrow() {
                break Ok(());
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
                _ = async { let _ = stop.wait_for(|stopping| *stopping).await; } => break Ok(()),
                _ = ctx.conn.closed() => break Ok(()),
            }
        };

        ctx.status.lock().set_catching_up(Direction::Pushing, false);
        result
    }

    /// Tells the peer the feed is caught up with an empty batch.
    async fn mark_caught_up(&self) -> ReplicationResult<()> {
        match self
            .ctx
            .conn
            .request(SyncMessage::Changes { entries: vec![] })
            .await?
        {
            SyncMessage::ChangesReply { .. } => Ok(()),
            other => Err(ReplicationError::Protocol(format!(
                "unexpected reply to changes: {}",
                other.name()
            ))),
        }
    }

    /// Offers everything after `self.since` and waits for the revisions the
    /// peer asked for to be sent.
    async fn drain(&mut self, semaphore: &Arc<Semaphore>) -> ReplicationResult<()> {
        let mut tasks = JoinSet::new();
        let result = self.offer_all(semaphore, &mut tasks).await;
        while tasks.join_next().await.is_some() {}
        result
    }

    async fn offer_all(
        &mut self,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
    ) -> ReplicationResult<()> {
        let ctx = Arc::clone(&self.ctx);
        loop {
            if ctx.is_stopping() {
                return Ok(());
            }
            let batch = ctx
                .store
                .changes_since(self.since, ctx.options.changes_batch_size)?;
            let Some(last) = batch.last() else {
                return Ok(());
            };
            self.since = last.sequence;

            let mut offered = Vec::with_capacity(batch.len());
            for change in batch {
                if self.filter.admits(&*ctx.store, &change)? {
                    offered.push(ChangeEntry {
                        sequence: change.sequence,
                        doc_id: change.doc_id,
                        rev_id: change.rev_id,
                        deleted: change.deleted,
                        body_size: change.body_size,
                    });
                } else {
                    self.track(|t| t.skip(change.sequence));
                }
            }
            if offered.is_empty() {
                continue;
            }

            debug!(count = offered.len(), through = self.since, "offering changes");
            let reply = ctx
                .conn
                .request(SyncMessage::Changes {
                    entries: offered.clone(),
                })
                .await?;
            let wants = match reply {
                SyncMessage::ChangesReply { wants } if wants.len() == offered.len() => wants,
                other => {
                    return Err(ReplicationError::Protocol(format!(
                        "unexpected reply to changes: {}",
                        other.name()
                    )))
                }
            };

            for (entry, want) in offered.into_iter().zip(wants) {
                let Some(want) = want else {
                    self.track(|t| t.skip(entry.sequence));
                    continue;
                };
                let permit = Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| ReplicationError::Protocol("send pool closed".into()))?;
                self.track(|t| t.begin(entry.sequence));
                let ticket = ctx.status.lock().begin_document(Direction::Pushing);
                let sender = RevSender {
                    ctx: Arc::clone(&ctx),
                    tracker: self.tracker.clone(),
                };
                tasks.spawn(async move {
                    sender.send(entry, want, ticket).await;
                    drop(permit);
                });
            }
        }
    }

    fn track(&self, f: impl FnOnce(&mut SequenceTracker)) {
        if let Some(tracker) = &self.tracker {
            f(&mut tracker.lock());
        }
    }
}

/// Sends one revision, retrying transient failures.
struct RevSender<S: Store> {
    ctx: Arc<SessionContext<S>>,
    tracker: Option<Arc<Mutex<SequenceTracker>>>,
}

impl<S: Store> RevSender<S> {
    async fn send(self, entry: ChangeEntry, want: RevWant, ticket: Ticket) {
        let retry = &self.ctx.options.retry;
        let peer_rev = want.known_base;
        let mut base = peer_rev.clone();
        let mut attempt = 0;
        let error = loop {
            attempt += 1;
            match self.send_once(&entry, base.as_ref(), peer_rev.as_ref()).await {
                Ok(()) => break None,
                Err(e)
                    if e.is_transient()
                        && attempt < retry.max_attempts
                        && !self.ctx.conn.is_closed() =>
                {
                    if e.code() == CODE_MISSING_ANCESTOR {
                        base = None;
                    }
                    let delay = retry.delay_for_attempt(attempt);
                    debug!(doc_id = %entry.doc_id, attempt, ?delay, error = %e, "retrying revision");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Some(e),
            }
        };

        match &error {
            Some(e) if e.is_transient() => {
                debug!(doc_id = %entry.doc_id, error = %e, "revision not sent");
            }
            Some(e) => {
                warn!(doc_id = %entry.doc_id, error = %e, "revision rejected");
                self.finish(entry.sequence);
            }
            None => self.finish(entry.sequence),
        }
        self.ctx.status.lock().end_document(
            ticket,
            DocumentEnded::new(entry.doc_id, Direction::Pushing, error),
        );
    }

    fn finish(&self, sequence: u64) {
        if let Some(tracker) = &self.tracker {
            tracker.lock().finish(sequence);
        }
    }

    async fn send_once(
        &self,
        entry: &ChangeEntry,
        base: Option<&RevId>,
        peer_rev: Option<&RevId>,
    ) -> ReplicationResult<()> {
        let (doc, base_body) = self.ctx.store.transaction(|txn| {
            let doc = txn.get(&entry.doc_id)?;
            let base_body = match (base, &doc) {
                (Some(base), Some(doc)) if doc.knows(base) => {
                    txn.revision_body(&entry.doc_id, base)?
                }
                _ => None,
            };
            Ok((doc, base_body))
        })?;
        let doc = doc.ok_or_else(|| ReplicationError::DocumentMissing(entry.doc_id.clone()))?;

        let options = &self.ctx.options;
        let body = encode_body(&doc, base, base_body.as_ref(), options.min_body_size_for_delta);
        let history = trim_history(doc.history, peer_rev, options.max_rev_history);
        let message = RevMessage {
            doc_id: doc.doc_id,
            rev_id: doc.rev_id,
            history,
            deleted: doc.flags.deleted,
            sequence: entry.sequence,
            body,
        };

        match self.ctx.conn.request(SyncMessage::Rev(message)).await? {
            SyncMessage::Ack => Ok(()),
            other => Err(ReplicationError::Protocol(format!(
                "unexpected reply to rev: {}",
                other.name()
            ))),
        }
    }
}
