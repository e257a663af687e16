//! # docsync Protocol
//!
//! Replication protocol types for docsync.
//!
//! This crate provides:
//! - Roles, per-direction modes and directions
//! - `RevId` revision identifiers and canonical body hashing
//! - The JSON delta codec used for delta-encoded revisions
//! - Blob keys and blob references embedded in bodies
//! - `CheckpointRecord` and its generation markers
//! - Protocol messages (checkpoints, change offers, revisions, blob chunks)
//!   and their CBOR frame encoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob;
mod checkpoint;
mod delta;
mod error;
mod messages;
mod revision;
mod types;

pub use blob::{blob_reference, find_blob_refs, has_blob_refs, BlobKey, BlobRef};
pub use checkpoint::{checkpoint_generation, next_checkpoint_marker, CheckpointRecord};
pub use delta::{apply_delta, create_delta};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ChangeEntry, Frame, FrameKind, RevBody, RevMessage, RevWant, SyncMessage, PROTOCOL_VERSION,
};
pub use revision::{body_size, canonical_body, sha256_hex, RevId};
pub use types::{Direction, Mode, Role};
