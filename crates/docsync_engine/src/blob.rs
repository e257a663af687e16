//! Blob transfers.
//!
//! A receiver fetches every blob a revision references before the revision is
//! stored, one chunk per `getBlob` request. Progress is reported per chunk on
//! both ends: as `Pulling` by the fetching side and `Pushing` by the serving
//! side.

use crate::error::{ReplicationError, ReplicationResult};
use crate::events::BlobProgress;
use crate::session::SessionContext;
use docsync_protocol::{find_blob_refs, BlobKey, BlobRef, Direction, SyncMessage};
use docsync_store::{Store, StoreError};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Moves blobs between the local store and the peer.
pub(crate) struct BlobTransferManager<S: Store> {
    ctx: Arc<SessionContext<S>>,
}

impl<S: Store> BlobTransferManager<S> {
    pub(crate) fn new(ctx: Arc<SessionContext<S>>) -> Self {
        Self { ctx }
    }

    /// Fetches every blob referenced by `body` that the local store lacks.
    ///
    /// Any failure is a non-transient blob failure of the owning document,
    /// except a lost connection.
    pub(crate) async fn fetch_missing(&self, doc_id: &str, body: &Value) -> ReplicationResult<()> {
        for blob in find_blob_refs(body) {
            if self.ctx.store.blob_len(&blob.key)?.is_some() {
                continue;
            }
            self.ctx.status.lock().begin_blob();
            let result = self.fetch(doc_id, &blob).await;
            self.ctx.status.lock().end_blob();
            result.map_err(|e| match e {
                ReplicationError::Disconnected | ReplicationError::Blob { .. } => e,
                other => ReplicationError::Blob {
                    doc_id: doc_id.to_string(),
                    message: other.to_string(),
                },
            })?;
        }
        Ok(())
    }

    async fn fetch(&self, doc_id: &str, blob: &BlobRef) -> ReplicationResult<()> {
        let failure = |message: String| ReplicationError::Blob {
            doc_id: doc_id.to_string(),
            message,
        };
        debug!(doc_id, property = %blob.property, key = %blob.key, length = blob.length, "fetching blob");

        let mut data: Vec<u8> = Vec::new();
        loop {
            let offset = data.len() as u64;
            let reply = self
                .ctx
                .conn
                .request(SyncMessage::GetBlob {
                    doc_id: doc_id.to_string(),
                    property: blob.property.clone(),
                    key: blob.key.clone(),
                    offset,
                    length: self.ctx.options.blob_chunk_size,
                })
                .await?;
            let (chunk, total) = match reply {
                SyncMessage::BlobChunk { data, total } => (data, total),
                other => return Err(failure(format!("unexpected reply {}", other.name()))),
            };
            if total != blob.length {
                return Err(failure(format!(
                    "peer reports {total} bytes, reference says {}",
                    blob.length
                )));
            }
            if chunk.is_empty() && offset < total {
                return Err(failure(format!("blob truncated at {offset} of {total} bytes")));
            }
            if offset + chunk.len() as u64 > total {
                return Err(failure("peer sent more bytes than the blob holds".into()));
            }

            data.extend_from_slice(&chunk);
            let completed = data.len() as u64;
            self.ctx.status.lock().blob_progress(BlobProgress {
                doc_id: doc_id.to_string(),
                property: blob.property.clone(),
                key: blob.key.clone(),
                direction: Direction::Pulling,
                bytes_completed: completed,
                bytes_total: total,
            });
            if completed >= total {
                break;
            }
        }

        self.ctx
            .store
            .install_blob(&blob.key, data.into())
            .map_err(|e| failure(e.to_string()))
    }

    /// Serves one chunk of a local blob.
    pub(crate) fn serve_chunk(
        &self,
        doc_id: String,
        property: String,
        key: BlobKey,
        offset: u64,
        length: u64,
    ) -> ReplicationResult<SyncMessage> {
        let total = self
            .ctx
            .store
            .blob_len(&key)?
            .ok_or_else(|| StoreError::MissingBlob(key.clone()))?;
        let length = length.min(self.ctx.options.blob_chunk_size);
        let data = self.ctx.store.read_blob(&key, offset, length)?;

        self.ctx.status.lock().blob_progress(BlobProgress {
            doc_id,
            property,
            key,
            direction: Direction::Pushing,
            bytes_completed: offset + data.len() as u64,
            bytes_total: total,
        });
        Ok(SyncMessage::BlobChunk {
            data: data.to_vec(),
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicatorOptions;
    use crate::events::ReplicatorEvent;
    use crate::session::tests::context;
    use bytes::Bytes;
    use docsync_protocol::blob_reference;
    use docsync_store::MemoryStore;
    use serde_json::json;

    #[test]
    fn chunks_are_capped_and_reported() {
        let store = Arc::new(MemoryStore::new());
        let key = store.put_blob(Bytes::from_static(b"0123456789")).unwrap();
        let options = ReplicatorOptions::passive().with_blob_chunk_size(4);
        let (ctx, mut events, _stop) = context(store, options);
        let blobs = BlobTransferManager::new(ctx);

        let reply = blobs
            .serve_chunk("doc".into(), "/photo".into(), key.clone(), 4, 100)
            .unwrap();
        assert_eq!(
            reply,
            SyncMessage::BlobChunk {
                data: b"4567".to_vec(),
                total: 10,
            }
        );

        let progress: Vec<BlobProgress> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                ReplicatorEvent::BlobProgress(progress) => Some(progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].bytes_completed, 8);
        assert_eq!(progress[0].bytes_total, 10);
        assert_eq!(progress[0].direction, Direction::Pushing);
    }

    #[test]
    fn serving_an_unknown_blob_fails() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, _events, _stop) = context(store, ReplicatorOptions::passive());
        let key = BlobKey::for_content(b"never stored");

        let err = BlobTransferManager::new(ctx)
            .serve_chunk("doc".into(), "/photo".into(), key.clone(), 0, 16)
            .unwrap_err();
        assert_eq!(err, ReplicationError::Store(StoreError::MissingBlob(key)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn blobs_already_present_are_not_fetched() {
        let store = Arc::new(MemoryStore::new());
        let key = store.put_blob(Bytes::from_static(b"cached")).unwrap();
        let (ctx, _events, _stop) = context(Arc::clone(&store), ReplicatorOptions::passive());
        let body = json!({"photo": blob_reference(&key, 6)});

        // The peer end is gone, so any request would fail.
        BlobTransferManager::new(Arc::clone(&ctx))
            .fetch_missing("doc", &body)
            .await
            .unwrap();
        assert_eq!(ctx.status.lock().status().progress.units_total, 0);
    }
}
