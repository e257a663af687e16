//! # docsync Store
//!
//! The document store the replication engine reads from and writes to.
//!
//! A store holds the current revision of every document (with a bounded
//! ancestor history and the ancestor bodies it still has), assigns a strictly
//! increasing sequence to every committed write, keeps raw key spaces for
//! checkpoint records, and stores content-addressed blobs.
//!
//! ## Design Principles
//!
//! - All document writes go through [`Store::transaction`]; a transaction is
//!   the only serialization point the engine relies on
//! - Replicated revisions keep the revision ID and history they were created
//!   with; a revision that does not descend from the current one is a
//!   conflict and leaves the store untouched
//! - Committed writes are announced through a `tokio::sync::watch` channel
//!
//! ## Example
//!
//! ```rust
//! use docsync_store::{MemoryStore, Store};
//! use serde_json::json;
//!
//! let store = MemoryStore::new();
//! store.put("doc-1", json!({"title": "hello"})).unwrap();
//! let changes = store.changes_since(0, 100).unwrap();
//! assert_eq!(changes[0].doc_id, "doc-1");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod document;
mod error;
mod memory;
mod store;

pub use document::{Change, DocFlags, Document, NewRevision, PutOutcome};
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStore, DEFAULT_MAX_HISTORY};
pub use store::{Documents, KeySpace, RawRecord, Store, Transaction};
