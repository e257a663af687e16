//! JSON-lines document files.
//!
//! One document per line: an object with an `_id` string, an optional
//! `_deleted` flag, and the body's own properties. Written files also carry
//! the current `_rev`, which is ignored on load.

use docsync_store::{Store, StoreError};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

const ID_FIELD: &str = "_id";
const REV_FIELD: &str = "_rev";
const DELETED_FIELD: &str = "_deleted";

/// Errors reading or writing a document file.
#[derive(Debug, Error)]
pub enum DocumentFileError {
    /// File I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line is not a JSON object with an `_id`.
    #[error("line {line}: {message}")]
    InvalidLine {
        /// One-based line number.
        line: usize,
        /// What is wrong with it.
        message: String,
    },

    /// The store rejected a document.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Loads every document of a JSON-lines file into `store`.
///
/// Returns the number of documents written. Blank lines are skipped.
pub fn load<S: Store>(path: &Path, store: &S) -> Result<usize, DocumentFileError> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let invalid = |message: String| DocumentFileError::InvalidLine {
            line: index + 1,
            message,
        };
        let Value::Object(mut body) =
            serde_json::from_str::<Value>(&line).map_err(|e| invalid(e.to_string()))?
        else {
            return Err(invalid("expected a JSON object".to_string()));
        };
        let doc_id = match body.remove(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return Err(invalid(format!("missing {ID_FIELD}"))),
        };
        body.remove(REV_FIELD);
        let deleted = matches!(body.remove(DELETED_FIELD), Some(Value::Bool(true)));

        if deleted {
            store.delete(&doc_id)?;
        } else {
            store.put(&doc_id, Value::Object(body))?;
        }
        count += 1;
    }
    Ok(count)
}

/// Writes every document of `store` to a JSON-lines file, in ID order.
pub fn save<S: Store>(path: &Path, store: &S) -> Result<usize, DocumentFileError> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut count = 0;
    for doc in store.enumerate()? {
        let doc = doc?;
        let mut line = Map::new();
        line.insert(ID_FIELD.to_string(), Value::String(doc.doc_id.clone()));
        line.insert(REV_FIELD.to_string(), Value::String(doc.rev_id.to_string()));
        if doc.is_deleted() {
            line.insert(DELETED_FIELD.to_string(), Value::Bool(true));
        } else if let Value::Object(body) = doc.body {
            line.extend(body);
        }
        serde_json::to_writer(&mut writer, &Value::Object(line))
            .map_err(std::io::Error::from)?;
        writer.write_all(b"\n")?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}
