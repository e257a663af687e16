//! Error types for the replication engine.

use docsync_protocol::ProtocolError;
use docsync_store::StoreError;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Status code for a malformed or unexpected message.
pub const CODE_BAD_REQUEST: u16 = 400;
/// Status code for a request the local modes do not allow.
pub const CODE_FORBIDDEN: u16 = 403;
/// Status code for a missing document or blob.
pub const CODE_NOT_FOUND: u16 = 404;
/// Status code for a revision conflict or a stale checkpoint.
pub const CODE_CONFLICT: u16 = 409;
/// Status code for a delta whose base revision is unknown.
pub const CODE_MISSING_ANCESTOR: u16 = 412;
/// Status code for a revision that cannot be decoded or verified.
pub const CODE_UNPROCESSABLE: u16 = 422;
/// Status code for an unexpected internal failure.
pub const CODE_INTERNAL: u16 = 500;
/// Status code for a failed blob transfer.
pub const CODE_BAD_GATEWAY: u16 = 502;
/// Status code for momentary unavailability.
pub const CODE_UNAVAILABLE: u16 = 503;

/// Errors that can occur during replication.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        transient: bool,
    },

    /// The connection closed while a request was outstanding.
    #[error("connection closed")]
    Disconnected,

    /// The passive peer answered the handshake with a non-success status.
    #[error("handshake rejected with status {status}")]
    HandshakeRejected {
        /// HTTP-like status code.
        status: u16,
    },

    /// Malformed or unexpected message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Message encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A delta arrived whose base revision the receiver does not have.
    #[error("missing delta base {base} for document {doc_id:?}")]
    MissingAncestor {
        /// Document ID.
        doc_id: String,
        /// The base revision named by the delta.
        base: String,
    },

    /// A revision could not be reconstructed or failed verification.
    #[error("corrupt revision of document {doc_id:?}: {message}")]
    CorruptRevision {
        /// Document ID.
        doc_id: String,
        /// Error message.
        message: String,
    },

    /// A referenced blob could not be transferred.
    #[error("blob transfer failed for document {doc_id:?}: {message}")]
    Blob {
        /// Document ID.
        doc_id: String,
        /// Error message.
        message: String,
    },

    /// An offered document is no longer in the store.
    #[error("document {0:?} not found")]
    DocumentMissing(String),

    /// The local modes do not allow the request.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A checkpoint save carried an outdated generation marker.
    #[error("stale checkpoint {checkpoint_id}")]
    StaleCheckpoint {
        /// Checkpoint ID.
        checkpoint_id: String,
    },

    /// Error reported by the peer.
    #[error("peer error {code}: {message}")]
    Remote {
        /// HTTP-like status code.
        code: u16,
        /// Error message.
        message: String,
        /// Whether the request may be retried.
        transient: bool,
    },
}

impl ReplicationError {
    /// Creates a retryable transport error.
    pub fn transport_transient(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            transient: false,
        }
    }

    /// Returns true if the failed operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            ReplicationError::Transport { transient, .. } => *transient,
            ReplicationError::Remote { transient, .. } => *transient,
            ReplicationError::Disconnected => true,
            ReplicationError::MissingAncestor { .. } => true,
            ReplicationError::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns the HTTP-like status code reported for this error.
    pub fn code(&self) -> u16 {
        match self {
            ReplicationError::Transport { .. } | ReplicationError::Disconnected => {
                CODE_UNAVAILABLE
            }
            ReplicationError::HandshakeRejected { status } => *status,
            ReplicationError::Protocol(_) | ReplicationError::Codec(_) => CODE_BAD_REQUEST,
            ReplicationError::Store(StoreError::Conflict { .. }) => CODE_CONFLICT,
            ReplicationError::Store(StoreError::Busy) => CODE_UNAVAILABLE,
            ReplicationError::Store(StoreError::MissingBlob(_)) => CODE_NOT_FOUND,
            ReplicationError::Store(_) => CODE_INTERNAL,
            ReplicationError::MissingAncestor { .. } => CODE_MISSING_ANCESTOR,
            ReplicationError::CorruptRevision { .. } => CODE_UNPROCESSABLE,
            ReplicationError::Blob { .. } => CODE_BAD_GATEWAY,
            ReplicationError::DocumentMissing(_) => CODE_NOT_FOUND,
            ReplicationError::Forbidden(_) => CODE_FORBIDDEN,
            ReplicationError::StaleCheckpoint { .. } => CODE_CONFLICT,
            ReplicationError::Remote { code, .. } => *code,
        }
    }

    /// Returns true if this error reports a revision conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ReplicationError::Store(StoreError::Conflict { .. })
                | ReplicationError::Remote {
                    code: CODE_CONFLICT,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::RevId;

    #[test]
    fn transient_errors() {
        assert!(ReplicationError::transport_transient("connection lost").is_transient());
        assert!(!ReplicationError::transport_fatal("refused").is_transient());
        assert!(ReplicationError::Disconnected.is_transient());
        assert!(ReplicationError::Store(StoreError::Busy).is_transient());
        assert!(ReplicationError::MissingAncestor {
            doc_id: "a".into(),
            base: "1-aa".into()
        }
        .is_transient());
        assert!(!ReplicationError::HandshakeRejected { status: 401 }.is_transient());
        assert!(!ReplicationError::Blob {
            doc_id: "a".into(),
            message: "digest mismatch".into()
        }
        .is_transient());
    }

    #[test]
    fn conflicts_map_to_409() {
        let err = ReplicationError::Store(StoreError::Conflict {
            doc_id: "a".into(),
            local: RevId::parse("1-aa").unwrap(),
            incoming: RevId::parse("1-bb").unwrap(),
        });
        assert_eq!(err.code(), CODE_CONFLICT);
        assert!(err.is_conflict());
        assert!(!err.is_transient());

        let remote = ReplicationError::Remote {
            code: err.code(),
            message: err.to_string(),
            transient: err.is_transient(),
        };
        assert!(remote.is_conflict());
    }

    #[test]
    fn error_display() {
        let err = ReplicationError::HandshakeRejected { status: 401 };
        assert_eq!(err.to_string(), "handshake rejected with status 401");
        assert_eq!(err.code(), 401);
        assert_eq!(ReplicationError::Disconnected.to_string(), "connection closed");
    }
}
