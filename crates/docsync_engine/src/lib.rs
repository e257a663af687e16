//! # docsync Engine
//!
//! Bidirectional replication of a document store with one peer.
//!
//! This crate provides:
//! - [`Replicator`], the session state machine for both the active and the
//!   passive side of a connection
//! - Per-direction push and pull with delta-encoded revisions and chunked
//!   blob transfer
//! - Checkpoints shared by both peers, so a later session resumes where the
//!   last one stopped
//! - Status aggregation with monotonic progress counters and an ordered
//!   event stream
//! - The [`Transport`] seam and an in-process [`LoopbackTransport`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use docsync_engine::{
//!     LoopbackTransport, Replicator, ReplicatorConfig, ReplicatorEvent, ReplicatorOptions,
//! };
//! use docsync_protocol::Mode;
//! use docsync_store::{MemoryStore, Store};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let local = Arc::new(MemoryStore::new());
//! local.put("note-1", json!({"title": "Hello"}))?;
//!
//! let (client_end, server_end) = LoopbackTransport::pair(Duration::from_millis(5));
//! let (client, mut events) = Replicator::new(
//!     ReplicatorConfig::client("loopback://remote", ReplicatorOptions::pushing(Mode::OneShot)),
//!     Arc::clone(&local),
//!     client_end,
//! );
//! let (server, _) = Replicator::new(
//!     ReplicatorConfig::server(ReplicatorOptions::passive()),
//!     Arc::new(MemoryStore::new()),
//!     server_end,
//! );
//!
//! server.start();
//! client.start();
//! while let Some(event) = events.recv().await {
//!     if let ReplicatorEvent::DocumentEnded(doc) = event {
//!         println!("{} synced: {}", doc.doc_id, doc.succeeded());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob;
mod checkpoint;
mod config;
mod connection;
mod error;
mod events;
mod loopback;
mod puller;
mod pusher;
mod replicator;
mod session;
mod status;
mod transport;

pub use checkpoint::CheckpointStore;
pub use config::{ReplicatorConfig, ReplicatorOptions, RetryConfig};
pub use error::{
    ReplicationError, ReplicationResult, CODE_BAD_GATEWAY, CODE_BAD_REQUEST, CODE_CONFLICT,
    CODE_FORBIDDEN, CODE_INTERNAL, CODE_MISSING_ANCESTOR, CODE_NOT_FOUND, CODE_UNAVAILABLE,
    CODE_UNPROCESSABLE,
};
pub use events::{BlobProgress, DocumentEnded, EventReceiver, ReplicatorEvent};
pub use loopback::LoopbackTransport;
pub use replicator::{Replicator, PROTOCOL_HEADER};
pub use status::{ActivityLevel, Progress, ReplicationStatus};
pub use transport::{
    CloseStatus, HandshakeResponse, Transport, TransportEvent, CLOSE_ABNORMAL, CLOSE_GOING_AWAY,
    CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
};
