//! Checkpoint identification and persistence.
//!
//! The active side keeps its copy of a checkpoint in the `checkpoints` key
//! space; the passive side keeps its copy in `peerCheckpoints`, versioned by a
//! generation marker that every save must quote. Both copies are keyed by the
//! same ID, derived from the peer identity and the options that decide which
//! documents flow.

use crate::config::ReplicatorOptions;
use crate::connection::Connection;
use crate::error::{ReplicationError, ReplicationResult, CODE_CONFLICT};
use docsync_protocol::{next_checkpoint_marker, sha256_hex, CheckpointRecord, SyncMessage};
use docsync_store::{KeySpace, RawRecord, Store};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Number of hex characters of the digest kept in a checkpoint ID.
const CHECKPOINT_ID_HEX_LEN: usize = 40;

/// Loads and saves the checkpoint of one peer pairing.
pub struct CheckpointStore<S: Store> {
    store: Arc<S>,
    checkpoint_id: String,
    remote_marker: Option<String>,
    saved: Option<CheckpointRecord>,
}

impl<S: Store> CheckpointStore<S> {
    /// Derives the checkpoint ID for a peer and a set of options.
    ///
    /// Only the modes and filters take part; tuning options such as batch
    /// sizes or the delta threshold do not change the ID.
    pub fn compute_id(peer_identity: &str, options: &ReplicatorOptions) -> String {
        let key = json!({
            "peer": peer_identity,
            "push": options.push,
            "pull": options.pull,
            "doc_ids": options.doc_ids,
            "filter_params": options.filter_params,
        });
        let hex = sha256_hex(key.to_string().as_bytes());
        format!("cp-{}", &hex[..CHECKPOINT_ID_HEX_LEN])
    }

    /// Creates a checkpoint store for the given ID.
    pub fn new(store: Arc<S>, checkpoint_id: impl Into<String>) -> Self {
        Self {
            store,
            checkpoint_id: checkpoint_id.into(),
            remote_marker: None,
            saved: None,
        }
    }

    /// Returns the checkpoint ID.
    pub fn id(&self) -> &str {
        &self.checkpoint_id
    }

    /// Loads this side's copy.
    pub fn load_local(&self) -> ReplicationResult<Option<CheckpointRecord>> {
        let raw = self.store.raw_get(KeySpace::Checkpoints, &self.checkpoint_id)?;
        Ok(raw.and_then(|r| CheckpointRecord::from_json(&r.body).ok()))
    }

    /// Saves this side's copy.
    pub fn save_local(&self, record: &CheckpointRecord) -> ReplicationResult<()> {
        self.store.raw_put(
            KeySpace::Checkpoints,
            &self.checkpoint_id,
            RawRecord {
                body: record.to_json()?,
                meta: self.remote_marker.clone().unwrap_or_default(),
            },
        )?;
        Ok(())
    }

    /// Loads both copies and returns the position to resume from.
    pub(crate) async fn load(
        &mut self,
        conn: &Connection,
        reset: bool,
    ) -> ReplicationResult<CheckpointRecord> {
        let local = self.load_local()?;
        let reply = conn
            .request(SyncMessage::GetCheckpoint {
                checkpoint_id: self.checkpoint_id.clone(),
            })
            .await?;
        let remote = match reply {
            SyncMessage::CheckpointReply { record, marker } => {
                self.remote_marker = marker;
                record
            }
            other => {
                return Err(ReplicationError::Protocol(format!(
                    "unexpected reply to getCheckpoint: {}",
                    other.name()
                )))
            }
        };

        let record = if reset {
            CheckpointRecord::default()
        } else {
            CheckpointRecord::reconcile(local, remote)
        };
        debug!(checkpoint = %self.checkpoint_id, ?local, ?remote, ?record, "loaded checkpoint");
        self.saved = Some(record);
        Ok(record)
    }

    /// Saves both copies, unless `record` is what was last saved.
    pub(crate) async fn save(
        &mut self,
        conn: &Connection,
        record: CheckpointRecord,
    ) -> ReplicationResult<()> {
        if self.saved == Some(record) {
            return Ok(());
        }
        self.save_local(&record)?;
        let reply = conn
            .request(SyncMessage::SetCheckpoint {
                checkpoint_id: self.checkpoint_id.clone(),
                record,
                marker: self.remote_marker.clone(),
            })
            .await;
        match reply {
            Ok(SyncMessage::CheckpointSaved { marker }) => {
                debug!(checkpoint = %self.checkpoint_id, %marker, ?record, "saved checkpoint");
                self.remote_marker = Some(marker);
                self.saved = Some(record);
                self.save_local(&record)
            }
            Ok(other) => Err(ReplicationError::Protocol(format!(
                "unexpected reply to setCheckpoint: {}",
                other.name()
            ))),
            Err(e) if e.code() == CODE_CONFLICT => Err(ReplicationError::StaleCheckpoint {
                checkpoint_id: self.checkpoint_id.clone(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Answers a peer's `getCheckpoint` from the `peerCheckpoints` key space.
    pub(crate) fn serve_get(&self) -> ReplicationResult<SyncMessage> {
        let raw = self
            .store
            .raw_get(KeySpace::PeerCheckpoints, &self.checkpoint_id)?;
        Ok(match raw {
            Some(raw) => SyncMessage::CheckpointReply {
                record: CheckpointRecord::from_json(&raw.body).ok(),
                marker: Some(raw.meta),
            },
            None => SyncMessage::CheckpointReply {
                record: None,
                marker: None,
            },
        })
    }

    /// Stores a peer's checkpoint if `marker` is the current generation.
    ///
    /// Returns the new generation marker.
    pub(crate) fn serve_set(
        &self,
        record: &CheckpointRecord,
        marker: Option<&str>,
    ) -> ReplicationResult<String> {
        let next = next_checkpoint_marker(marker);
        let stored = self.store.raw_compare_and_put(
            KeySpace::PeerCheckpoints,
            &self.checkpoint_id,
            marker,
            RawRecord {
                body: record.to_json()?,
                meta: next.clone(),
            },
        )?;
        if stored {
            Ok(next)
        } else {
            Err(ReplicationError::StaleCheckpoint {
                checkpoint_id: self.checkpoint_id.clone(),
            })
        }
    }
}

/// Tracks which sequences of one direction are durably done.
///
/// The checkpoint only ever covers a contiguous prefix: a sequence that is
/// still in flight, or ended with a transient error, holds it back.
#[derive(Debug, Clone, Default)]
pub(crate) struct SequenceTracker {
    max_seen: u64,
    pending: BTreeSet<u64>,
}

impl SequenceTracker {
    pub(crate) fn new(since: u64) -> Self {
        Self {
            max_seen: since,
            pending: BTreeSet::new(),
        }
    }

    /// Records a sequence that needs no work.
    pub(crate) fn skip(&mut self, sequence: u64) {
        self.max_seen = self.max_seen.max(sequence);
    }

    /// Records a sequence whose document is being transferred.
    pub(crate) fn begin(&mut self, sequence: u64) {
        self.skip(sequence);
        self.pending.insert(sequence);
    }

    /// Records that a sequence's document is done.
    pub(crate) fn finish(&mut self, sequence: u64) {
        self.pending.remove(&sequence);
    }

    /// Returns the highest sequence up to which everything is done.
    pub(crate) fn checkpoint(&self) -> u64 {
        match self.pending.first() {
            Some(first) => first.saturating_sub(1),
            None => self.max_seen,
        }
    }
}
