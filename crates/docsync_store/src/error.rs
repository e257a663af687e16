//! Error types for store operations.

use docsync_protocol::{BlobKey, RevId};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The incoming revision does not descend from the current revision.
    #[error("conflict on document {doc_id:?}: local {local} is not an ancestor of {incoming}")]
    Conflict {
        /// Document ID.
        doc_id: String,
        /// Current local revision.
        local: RevId,
        /// Revision that was being stored.
        incoming: RevId,
    },

    /// The store is momentarily busy; the operation may be retried.
    #[error("store busy")]
    Busy,

    /// A body references a blob that is not in the store.
    #[error("missing blob {0}")]
    MissingBlob(BlobKey),

    /// Blob content does not match its key.
    #[error("blob content does not match key {0}")]
    CorruptBlob(BlobKey),

    /// A read went past the end of a blob.
    #[error("read past end of blob {key}: offset {offset}, size {size}")]
    BlobReadPastEnd {
        /// Blob key.
        key: BlobKey,
        /// Requested offset.
        offset: u64,
        /// Blob size.
        size: u64,
    },
}

impl StoreError {
    /// Returns true if retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(StoreError::Busy.is_transient());
        let key = docsync_protocol::BlobKey::for_content(b"x");
        assert!(!StoreError::MissingBlob(key.clone()).is_transient());
        assert!(!StoreError::CorruptBlob(key).is_transient());
    }

    #[test]
    fn conflict_display_names_both_revisions() {
        let err = StoreError::Conflict {
            doc_id: "doc".into(),
            local: RevId::parse("2-aa").unwrap(),
            incoming: RevId::parse("2-bb").unwrap(),
        };
        let msg = err.to_string();
        assert!(msg.contains("2-aa"));
        assert!(msg.contains("2-bb"));
    }
}
