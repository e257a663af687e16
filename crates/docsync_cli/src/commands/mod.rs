//! CLI command implementations.

pub mod checkpoint_id;
pub mod documents;
pub mod loopback;
