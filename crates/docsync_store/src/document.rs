//! Document and revision types.

use docsync_protocol::{has_blob_refs, RevId};
use serde_json::Value;

/// Document flags visible to applications and compared across peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DocFlags {
    /// The current revision is a deletion (tombstone).
    pub deleted: bool,
    /// The current body references at least one blob.
    pub has_attachments: bool,
}

impl DocFlags {
    /// Derives the flags of a revision.
    pub fn for_revision(deleted: bool, body: &Value) -> Self {
        Self {
            deleted,
            has_attachments: has_blob_refs(body),
        }
    }
}

/// The current revision of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Document ID.
    pub doc_id: String,
    /// Current revision.
    pub rev_id: RevId,
    /// Ancestors of the current revision, newest first.
    pub history: Vec<RevId>,
    /// Current body (empty object for tombstones).
    pub body: Value,
    /// Flags.
    pub flags: DocFlags,
    /// Sequence of the write that produced the current revision.
    pub sequence: u64,
}

impl Document {
    /// Returns true if `rev_id` is the current revision or one of its ancestors.
    pub fn knows(&self, rev_id: &RevId) -> bool {
        self.rev_id == *rev_id || self.history.contains(rev_id)
    }

    /// Returns true if the current revision is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.flags.deleted
    }
}

/// One entry of the changes feed: the latest revision of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Sequence of the latest write to the document.
    pub sequence: u64,
    /// Document ID.
    pub doc_id: String,
    /// Current revision.
    pub rev_id: RevId,
    /// Whether the revision is a deletion.
    pub deleted: bool,
    /// Size of the canonical body.
    pub body_size: u64,
}

/// A revision received from a peer, stored with its original ID.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRevision {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID assigned by the originating peer.
    pub rev_id: RevId,
    /// Ancestors, newest first.
    pub history: Vec<RevId>,
    /// Full body.
    pub body: Value,
    /// Whether the revision is a deletion.
    pub deleted: bool,
}

/// Result of storing a replicated revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The revision became the current revision.
    Inserted,
    /// The store already had this revision (or a descendant of it).
    AlreadyPresent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{blob_reference, BlobKey};
    use serde_json::json;

    #[test]
    fn flags_detect_attachments() {
        let key = BlobKey::for_content(b"abc");
        let flags = DocFlags::for_revision(false, &json!({"file": blob_reference(&key, 3)}));
        assert!(flags.has_attachments);
        assert!(!flags.deleted);

        let flags = DocFlags::for_revision(true, &json!({}));
        assert!(flags.deleted);
        assert!(!flags.has_attachments);
    }

    #[test]
    fn knows_current_and_ancestors() {
        let doc = Document {
            doc_id: "d".into(),
            rev_id: RevId::parse("3-c").unwrap(),
            history: vec![RevId::parse("2-b").unwrap(), RevId::parse("1-a").unwrap()],
            body: json!({}),
            flags: DocFlags::default(),
            sequence: 9,
        };
        assert!(doc.knows(&RevId::parse("3-c").unwrap()));
        assert!(doc.knows(&RevId::parse("1-a").unwrap()));
        assert!(!doc.knows(&RevId::parse("2-x").unwrap()));
    }
}
