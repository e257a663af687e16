//! Protocol messages and their CBOR frame encoding.
//!
//! Every message travels inside a [`Frame`] that pairs it with a request ID.
//! A response reuses the ID of the request it answers, which lets both peers
//! issue requests concurrently over one ordered channel.

use crate::checkpoint::CheckpointRecord;
use crate::error::{ProtocolError, ProtocolResult};
use crate::revision::RevId;
use crate::blob::BlobKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// One entry of a change offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Sender-side sequence of this change.
    pub sequence: u64,
    /// Document ID.
    pub doc_id: String,
    /// Current revision on the sender.
    pub rev_id: RevId,
    /// Whether the revision is a deletion.
    pub deleted: bool,
    /// Size of the canonical body in bytes.
    pub body_size: u64,
}

/// The receiver's answer to one offered change it wants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevWant {
    /// The receiver's current revision, usable as a delta base.
    pub known_base: Option<RevId>,
}

/// How a revision body is transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RevBody {
    /// The complete body.
    Full(Value),
    /// A delta against a revision the receiver already has.
    Delta {
        /// The base revision.
        base: RevId,
        /// Delta produced by [`crate::delta::create_delta`].
        delta: Value,
    },
}

impl RevBody {
    /// Returns true if this is a delta encoding.
    pub fn is_delta(&self) -> bool {
        matches!(self, RevBody::Delta { .. })
    }
}

/// A revision sent to the receiving peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevMessage {
    /// Document ID.
    pub doc_id: String,
    /// Revision being sent.
    pub rev_id: RevId,
    /// Ancestors of `rev_id`, newest first, excluding `rev_id` itself.
    pub history: Vec<RevId>,
    /// Whether the revision is a deletion.
    pub deleted: bool,
    /// Sender-side sequence of the revision.
    pub sequence: u64,
    /// The body.
    pub body: RevBody,
}

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Asks the passive peer for its copy of a checkpoint.
    GetCheckpoint {
        /// Checkpoint ID.
        checkpoint_id: String,
    },
    /// Reply to [`SyncMessage::GetCheckpoint`].
    CheckpointReply {
        /// Stored record, if any.
        record: Option<CheckpointRecord>,
        /// Generation marker of the stored record.
        marker: Option<String>,
    },
    /// Stores a checkpoint on the passive peer.
    SetCheckpoint {
        /// Checkpoint ID.
        checkpoint_id: String,
        /// New record.
        record: CheckpointRecord,
        /// Marker the sender last saw (`None` for a first save).
        marker: Option<String>,
    },
    /// Reply to [`SyncMessage::SetCheckpoint`].
    CheckpointSaved {
        /// New generation marker.
        marker: String,
    },
    /// Asks the peer to start offering its changes.
    SubscribeChanges {
        /// Offer changes after this sequence.
        since: u64,
        /// Keep offering new changes after catching up.
        continuous: bool,
        /// Optional document-ID allow-list.
        doc_ids: Option<Vec<String>>,
        /// Property-equality filter.
        filter_params: BTreeMap<String, String>,
    },
    /// A batch of offered changes. An empty batch means "caught up".
    Changes {
        /// Offered changes in sequence order.
        entries: Vec<ChangeEntry>,
    },
    /// Reply to [`SyncMessage::Changes`], aligned with its entries.
    ChangesReply {
        /// `None` if the entry is not wanted.
        wants: Vec<Option<RevWant>>,
    },
    /// A revision.
    Rev(RevMessage),
    /// Requests a range of a blob's bytes.
    GetBlob {
        /// Document whose revision references the blob.
        doc_id: String,
        /// Property path of the reference within the body.
        property: String,
        /// Blob key.
        key: BlobKey,
        /// Start offset.
        offset: u64,
        /// Maximum number of bytes.
        length: u64,
    },
    /// Reply to [`SyncMessage::GetBlob`].
    BlobChunk {
        /// Bytes starting at the requested offset.
        data: Vec<u8>,
        /// Total blob length.
        total: u64,
    },
    /// Generic success reply.
    Ack,
    /// Generic error reply.
    Error {
        /// HTTP-like status code.
        code: u16,
        /// Description.
        message: String,
        /// Whether the request may be retried.
        transient: bool,
    },
}

impl SyncMessage {
    /// Returns the message name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            SyncMessage::GetCheckpoint { .. } => "getCheckpoint",
            SyncMessage::CheckpointReply { .. } => "checkpoint",
            SyncMessage::SetCheckpoint { .. } => "setCheckpoint",
            SyncMessage::CheckpointSaved { .. } => "checkpointSaved",
            SyncMessage::SubscribeChanges { .. } => "subChanges",
            SyncMessage::Changes { .. } => "changes",
            SyncMessage::ChangesReply { .. } => "changesReply",
            SyncMessage::Rev(_) => "rev",
            SyncMessage::GetBlob { .. } => "getBlob",
            SyncMessage::BlobChunk { .. } => "blobChunk",
            SyncMessage::Ack => "ack",
            SyncMessage::Error { .. } => "error",
        }
    }

    /// Builds an error reply.
    pub fn error(code: u16, message: impl Into<String>, transient: bool) -> Self {
        SyncMessage::Error {
            code,
            message: message.into(),
            transient,
        }
    }
}

/// Whether a frame starts or answers an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// A request expecting exactly one response.
    Request,
    /// The response to the request with the same ID.
    Response,
}

/// The unit sent over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Request ID, unique per sender.
    pub id: u64,
    /// Request or response.
    pub kind: FrameKind,
    /// Payload.
    pub message: SyncMessage,
}

impl Frame {
    /// Creates a request frame.
    pub fn request(id: u64, message: SyncMessage) -> Self {
        Self {
            id,
            kind: FrameKind::Request,
            message,
        }
    }

    /// Creates a response frame.
    pub fn response(id: u64, message: SyncMessage) -> Self {
        Self {
            id,
            kind: FrameKind::Response,
            message,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rev_frame_survives_encoding() {
        let rev = RevMessage {
            doc_id: "doc-1".into(),
            rev_id: RevId::parse("2-bb").unwrap(),
            history: vec![RevId::parse("1-aa").unwrap()],
            deleted: false,
            sequence: 12,
            body: RevBody::Delta {
                base: RevId::parse("1-aa").unwrap(),
                delta: json!({"count": [2], "nested": {"x": []}}),
            },
        };
        let frame = Frame::request(7, SyncMessage::Rev(rev));

        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.message.name(), "rev");
    }

    #[test]
    fn changes_reply_keeps_alignment() {
        let reply = Frame::response(
            3,
            SyncMessage::ChangesReply {
                wants: vec![
                    None,
                    Some(RevWant {
                        known_base: Some(RevId::parse("4-cd").unwrap()),
                    }),
                    Some(RevWant { known_base: None }),
                ],
            },
        );
        let decoded = Frame::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, FrameKind::Response);
        match decoded.message {
            SyncMessage::ChangesReply { wants } => {
                assert_eq!(wants.len(), 3);
                assert!(wants[0].is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Frame::decode(&[0xff, 0x00, 0x13]).is_err());
    }
}
