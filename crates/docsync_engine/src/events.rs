//! Events delivered to the replicator's owner.

use crate::error::ReplicationError;
use crate::status::ReplicationStatus;
use crate::transport::{CloseStatus, HandshakeResponse};
use docsync_protocol::{BlobKey, Direction};
use tokio::sync::mpsc;

/// Receiving end of a replicator's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<ReplicatorEvent>;

/// One notification from a replicator.
///
/// Events of one replicator arrive through a single ordered channel. The
/// handshake response always precedes the first status change, and a
/// document's blob progress always precedes its `DocumentEnded`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicatorEvent {
    /// The handshake completed (once per session).
    HandshakeReceived(HandshakeResponse),
    /// The status changed.
    StatusChanged(ReplicationStatus),
    /// A document task ended.
    DocumentEnded(DocumentEnded),
    /// Bytes of a blob moved.
    BlobProgress(BlobProgress),
    /// The connection closed (once per session).
    ConnectionClosed(CloseStatus),
}

/// The outcome of one document task.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentEnded {
    /// Document ID.
    pub doc_id: String,
    /// Direction of the transfer.
    pub direction: Direction,
    /// Error, if the document was not synced.
    pub error: Option<ReplicationError>,
    /// Whether the error was transient.
    pub transient: bool,
}

impl DocumentEnded {
    pub(crate) fn new(
        doc_id: impl Into<String>,
        direction: Direction,
        error: Option<ReplicationError>,
    ) -> Self {
        let transient = error.as_ref().is_some_and(ReplicationError::is_transient);
        Self {
            doc_id: doc_id.into(),
            direction,
            error,
            transient,
        }
    }

    /// Returns true if the document was synced.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Progress of one blob transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProgress {
    /// Document whose revision references the blob.
    pub doc_id: String,
    /// Property path of the reference.
    pub property: String,
    /// Blob key.
    pub key: BlobKey,
    /// Direction of the transfer.
    pub direction: Direction,
    /// Bytes transferred so far.
    pub bytes_completed: u64,
    /// Total blob size.
    pub bytes_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_flag_follows_error() {
        let ok = DocumentEnded::new("a", Direction::Pushing, None);
        assert!(ok.succeeded());
        assert!(!ok.transient);

        let busy = DocumentEnded::new(
            "a",
            Direction::Pulling,
            Some(ReplicationError::Disconnected),
        );
        assert!(busy.transient);

        let conflict = DocumentEnded::new(
            "a",
            Direction::Pulling,
            Some(ReplicationError::Remote {
                code: 409,
                message: "conflict".into(),
                transient: false,
            }),
        );
        assert!(!conflict.transient);
        assert!(!conflict.succeeded());
    }
}
