//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding, decoding or interpreting protocol data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a frame.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode a frame.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A revision ID did not have the `<generation>-<digest>` form.
    #[error("invalid revision id: {0:?}")]
    InvalidRevId(String),

    /// A blob key did not have the `sha256-<hex>` form.
    #[error("invalid blob key: {0:?}")]
    InvalidBlobKey(String),

    /// A delta could not be applied to its base.
    #[error("invalid delta: {message}")]
    InvalidDelta {
        /// Description of the problem.
        message: String,
    },
}

impl ProtocolError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create an invalid delta error.
    pub fn invalid_delta(message: impl Into<String>) -> Self {
        Self::InvalidDelta {
            message: message.into(),
        }
    }
}
