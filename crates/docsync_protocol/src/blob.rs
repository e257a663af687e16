//! Blob keys and blob references embedded in document bodies.

use crate::error::{ProtocolError, ProtocolResult};
use crate::revision::sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

const BLOB_KEY_PREFIX: &str = "sha256-";

/// Content address of a blob: `sha256-<hex digest>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobKey(String);

impl BlobKey {
    /// Computes the key for the given content.
    pub fn for_content(data: &[u8]) -> Self {
        Self(format!("{BLOB_KEY_PREFIX}{}", sha256_hex(data)))
    }

    /// Parses a key, validating its shape.
    pub fn parse(value: impl Into<String>) -> ProtocolResult<Self> {
        let value = value.into();
        let valid = value
            .strip_prefix(BLOB_KEY_PREFIX)
            .map_or(false, |hex| hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()));
        if valid {
            Ok(Self(value))
        } else {
            Err(ProtocolError::InvalidBlobKey(value))
        }
    }

    /// Returns true if `data` hashes to this key.
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::for_content(data) == *self
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BlobKey {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<BlobKey> for String {
    fn from(key: BlobKey) -> Self {
        key.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reference to a blob found inside a document body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    /// Path of the referencing property, e.g. `/photo` or `/album/0`.
    pub property: String,
    /// Content key.
    pub key: BlobKey,
    /// Declared length in bytes.
    pub length: u64,
}

/// Builds the JSON object that references a blob from a document body.
pub fn blob_reference(key: &BlobKey, length: u64) -> Value {
    json!({
        "@type": "blob",
        "digest": key.as_str(),
        "length": length,
    })
}

/// Returns every well-formed blob reference in `body`, in document order.
pub fn find_blob_refs(body: &Value) -> Vec<BlobRef> {
    let mut refs = Vec::new();
    collect_refs(body, &mut String::new(), &mut refs);
    refs
}

/// Returns true if `body` references at least one blob.
pub fn has_blob_refs(body: &Value) -> bool {
    !find_blob_refs(body).is_empty()
}

fn collect_refs(value: &Value, path: &mut String, refs: &mut Vec<BlobRef>) {
    match value {
        Value::Object(map) => {
            if let Some(blob) = as_blob_ref(value, path) {
                refs.push(blob);
                return;
            }
            for (key, child) in map {
                let len = path.len();
                path.push('/');
                path.push_str(key);
                collect_refs(child, path, refs);
                path.truncate(len);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                let len = path.len();
                path.push('/');
                path.push_str(&index.to_string());
                collect_refs(child, path, refs);
                path.truncate(len);
            }
        }
        _ => {}
    }
}

fn as_blob_ref(value: &Value, path: &str) -> Option<BlobRef> {
    if value.get("@type")?.as_str()? != "blob" {
        return None;
    }
    let key = BlobKey::parse(value.get("digest")?.as_str()?).ok()?;
    let length = value.get("length")?.as_u64()?;
    Some(BlobRef {
        property: path.to_string(),
        key,
        length,
    })
}
