//! Per-connection session state and request dispatch.

use crate::blob::BlobTransferManager;
use crate::checkpoint::CheckpointStore;
use crate::config::ReplicatorOptions;
use crate::connection::Connection;
use crate::error::{ReplicationError, ReplicationResult};
use crate::puller::Puller;
use crate::pusher::{ChangeFilter, Pusher};
use crate::status::StatusAggregator;
use docsync_protocol::{Mode, Role, SyncMessage};
use docsync_store::Store;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Everything the tasks of one session share.
pub(crate) struct SessionContext<S: Store> {
    pub(crate) store: Arc<S>,
    pub(crate) conn: Arc<Connection>,
    pub(crate) options: ReplicatorOptions,
    pub(crate) role: Role,
    pub(crate) status: Arc<Mutex<StatusAggregator>>,
    pub(crate) stop: watch::Receiver<bool>,
    /// Checkpoint ID: computed up front by the active side, learned from the
    /// first `getCheckpoint` by the passive side.
    pub(crate) checkpoint_id: Arc<Mutex<Option<String>>>,
}

impl<S: Store> SessionContext<S> {
    /// Returns true once a stop was requested or the connection closed.
    pub(crate) fn is_stopping(&self) -> bool {
        *self.stop.borrow() || self.conn.is_closed()
    }
}

/// Answers one request from the peer.
pub(crate) async fn handle_request<S: Store>(
    ctx: Arc<SessionContext<S>>,
    puller: Arc<Puller<S>>,
    id: u64,
    message: SyncMessage,
) {
    let name = message.name();
    let reply = match message {
        SyncMessage::GetCheckpoint { checkpoint_id } => {
            passive_only(&ctx, name).and_then(|()| {
                *ctx.checkpoint_id.lock() = Some(checkpoint_id.clone());
                CheckpointStore::new(Arc::clone(&ctx.store), checkpoint_id).serve_get()
            })
        }
        SyncMessage::SetCheckpoint {
            checkpoint_id,
            record,
            marker,
        } => passive_only(&ctx, name).and_then(|()| {
            CheckpointStore::new(Arc::clone(&ctx.store), checkpoint_id)
                .serve_set(&record, marker.as_deref())
                .map(|marker| SyncMessage::CheckpointSaved { marker })
        }),
        SyncMessage::SubscribeChanges {
            since,
            continuous,
            doc_ids,
            filter_params,
        } => {
            if ctx.options.push != Mode::Disabled {
                if let Err(e) = ctx.conn.respond(id, SyncMessage::Ack).await {
                    debug!(error = %e, "could not acknowledge subscription");
                    return;
                }
                debug!(since, continuous, "serving changes");
                let filter = ChangeFilter::new(doc_ids, filter_params);
                let pusher = Pusher::new(Arc::clone(&ctx), since, continuous, filter, None);
                if let Err(e) = pusher.run().await {
                    debug!(error = %e, "change feed ended");
                }
                return;
            }
            Err(ReplicationError::Forbidden("push is disabled".into()))
        }
        SyncMessage::Changes { entries } => {
            if ctx.options.pull == Mode::Disabled {
                Err(ReplicationError::Forbidden("pull is disabled".into()))
            } else {
                puller.handle_changes(entries)
            }
        }
        SyncMessage::Rev(rev) => {
            if ctx.options.pull == Mode::Disabled {
                Err(ReplicationError::Forbidden("pull is disabled".into()))
            } else {
                puller.handle_rev(rev).await.map(|()| SyncMessage::Ack)
            }
        }
        SyncMessage::GetBlob {
            doc_id,
            property,
            key,
            offset,
            length,
        } => BlobTransferManager::new(Arc::clone(&ctx))
            .serve_chunk(doc_id, property, key, offset, length),
        other => Err(ReplicationError::Protocol(format!(
            "unexpected request {}",
            other.name()
        ))),
    };

    let sent = match reply {
        Ok(message) => ctx.conn.respond(id, message).await,
        Err(e) => {
            if e.is_transient() {
                debug!(request = name, error = %e, "request failed");
            } else {
                warn!(request = name, error = %e, "request failed");
            }
            ctx.conn.respond_error(id, &e).await
        }
    };
    if let Err(e) = sent {
        debug!(request = name, error = %e, "could not answer");
    }
}

fn passive_only<S: Store>(ctx: &SessionContext<S>, request: &str) -> ReplicationResult<()> {
    if ctx.role.is_active() {
        Err(ReplicationError::Forbidden(format!(
            "{request} is only served by the passive side"
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::EventReceiver;
    use crate::loopback::LoopbackTransport;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// A context over a connection nobody reads from, for exercising the
    /// parts of a session that do not talk to the peer.
    pub(crate) fn context<S: Store>(
        store: Arc<S>,
        options: ReplicatorOptions,
    ) -> (Arc<SessionContext<S>>, EventReceiver, watch::Sender<bool>) {
        let (transport, _peer) = LoopbackTransport::pair(Duration::ZERO);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut status = StatusAggregator::new(events_tx);
        status.begin_session();
        status.connected();
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = Arc::new(SessionContext {
            store,
            conn: Connection::new(Arc::new(transport)),
            options,
            role: Role::Server,
            status: Arc::new(Mutex::new(status)),
            stop: stop_rx,
            checkpoint_id: Arc::new(Mutex::new(None)),
        });
        (ctx, events_rx, stop_tx)
    }

    #[test]
    fn stop_request_is_visible() {
        let store = Arc::new(docsync_store::MemoryStore::new());
        let (ctx, _events, stop) = context(store, ReplicatorOptions::passive());
        assert!(!ctx.is_stopping());
        stop.send_replace(true);
        assert!(ctx.is_stopping());
    }

    #[test]
    fn checkpoint_requests_are_passive_only() {
        let store = Arc::new(docsync_store::MemoryStore::new());
        let (ctx, _events, _stop) = context(store, ReplicatorOptions::passive());
        assert!(passive_only(&ctx, "getCheckpoint").is_ok());
    }
}
