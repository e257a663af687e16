//! # docsync Testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - Fixtures that populate stores with documents, deletions and blobs
//! - Canonical store comparison for asserting that two peers converged
//! - Property-based generators for document bodies using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[test]
//! fn stores_converge() {
//!     let a = populated_store(10);
//!     let b = populated_store(10);
//!     assert_stores_match(&a, &b);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
