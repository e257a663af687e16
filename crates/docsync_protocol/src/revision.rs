//! Revision identifiers.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of digest bytes kept in a revision ID.
const REV_DIGEST_BYTES: usize = 16;

/// A revision identifier of the form `<generation>-<digest>`.
///
/// The generation counts the revisions in the document's history, so a
/// revision's parent always has a generation one lower. Revision IDs are
/// preserved verbatim when a revision is replicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevId(String);

impl RevId {
    /// Parses a revision ID, validating its shape.
    pub fn parse(value: impl Into<String>) -> ProtocolResult<Self> {
        let value = value.into();
        let valid = match value.split_once('-') {
            Some((generation, digest)) => {
                !digest.is_empty() && generation.parse::<u64>().map_or(false, |g| g > 0)
            }
            None => false,
        };
        if valid {
            Ok(Self(value))
        } else {
            Err(ProtocolError::InvalidRevId(value))
        }
    }

    /// Computes the ID of a new revision on top of `parent`.
    ///
    /// The digest covers the parent ID, the deletion flag and the canonical
    /// body, so identical edits made on two peers produce identical IDs.
    pub fn compute(parent: Option<&RevId>, deleted: bool, body: &Value) -> Self {
        let generation = parent.map_or(1, |p| p.generation() + 1);

        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.as_str().as_bytes());
        }
        hasher.update([u8::from(deleted)]);
        hasher.update(canonical_body(body));
        let digest = hasher.finalize();

        Self(format!(
            "{generation}-{}",
            hex::encode(&digest[..REV_DIGEST_BYTES])
        ))
    }

    /// Returns the generation number.
    pub fn generation(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(g, _)| g.parse().ok())
            .unwrap_or(0)
    }

    /// Returns the digest part.
    pub fn digest(&self) -> &str {
        self.0.split_once('-').map_or("", |(_, d)| d)
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RevId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RevId> for String {
    fn from(rev: RevId) -> Self {
        rev.0
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the canonical byte form of a document body.
///
/// Object keys are emitted in sorted order, so structurally equal bodies
/// always produce identical bytes.
pub fn canonical_body(body: &Value) -> Vec<u8> {
    body.to_string().into_bytes()
}

/// Returns the lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Returns the size of the canonical form of a body.
pub fn body_size(body: &Value) -> usize {
    canonical_body(body).len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn sha256_hex_is_lowercase_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn parse_valid_and_invalid() {
        let rev = RevId::parse("3-abcdef").unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.digest(), "abcdef");

        assert!(RevId::parse("abc").is_err());
        assert!(RevId::parse("0-abc").is_err());
        assert!(RevId::parse("x-abc").is_err());
        assert!(RevId::parse("2-").is_err());
    }

    #[test]
    fn compute_increments_generation() {
        let body = json!({"name": "alice"});
        let first = RevId::compute(None, false, &body);
        assert_eq!(first.generation(), 1);

        let second = RevId::compute(Some(&first), false, &json!({"name": "bob"}));
        assert_eq!(second.generation(), 2);
        assert_ne!(first, second);
    }

    #[test]
    fn compute_is_deterministic() {
        let a = RevId::compute(None, false, &json!({"b": 1, "a": 2}));
        let b = RevId::compute(None, false, &json!({"a": 2, "b": 1}));
        assert_eq!(a, b);

        let deleted = RevId::compute(None, true, &json!({"b": 1, "a": 2}));
        assert_ne!(a, deleted);
    }

    #[test]
    fn serde_rejects_malformed_ids() {
        let ok: Result<RevId, _> = serde_json::from_str("\"1-aa\"");
        assert!(ok.is_ok());
        let bad: Result<RevId, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }

    proptest! {
        #[test]
        fn computed_ids_always_parse(gen in 1u64..1000, text in "[a-z]{0,12}") {
            let parent = RevId::parse(format!("{gen}-seed")).unwrap();
            let rev = RevId::compute(Some(&parent), false, &json!({ "text": text }));
            prop_assert_eq!(rev.generation(), gen + 1);
            prop_assert!(RevId::parse(rev.as_str()).is_ok());
        }
    }
}
