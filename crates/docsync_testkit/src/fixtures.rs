//! Store fixtures and convergence checks.
//!
//! Provides convenience functions for filling stores with documents and for
//! asserting that two stores hold the same replicated state.

use bytes::Bytes;
use docsync_protocol::{blob_reference, canonical_body, find_blob_refs, BlobKey};
use docsync_store::{Document, MemoryStore, Store};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Returns the ID of the `index`-th fixture document.
pub fn doc_id(index: usize) -> String {
    format!("doc-{index:04}")
}

/// A small document body. Even indexes are notes, odd ones tasks.
pub fn sample_body(index: usize) -> Value {
    json!({
        "index": index,
        "title": format!("Document {index}"),
        "type": if index % 2 == 0 { "note" } else { "task" },
        "tags": ["fixture"],
    })
}

/// A body comfortably above the default delta threshold.
pub fn large_body(index: usize, revision: usize) -> Value {
    json!({
        "index": index,
        "revision": revision,
        "title": format!("Document {index}"),
        "text": "lorem ipsum dolor sit amet ".repeat(20),
        "meta": {"author": "fixture", "version": revision},
    })
}

/// Writes `count` sample documents and returns their IDs.
pub fn populate<S: Store>(store: &S, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let id = doc_id(i);
            store
                .put(&id, sample_body(i))
                .expect("Failed to put fixture document");
            id
        })
        .collect()
}

/// Creates an in-memory store holding `count` sample documents.
pub fn populated_store(count: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    populate(&*store, count);
    store
}

/// Stores `data` as a blob and writes a document referencing it under
/// `/photo`. Returns the blob key.
pub fn put_with_blob<S: Store>(store: &S, doc_id: &str, data: &[u8]) -> BlobKey {
    let key = store
        .put_blob(Bytes::copy_from_slice(data))
        .expect("Failed to put blob");
    store
        .put(
            doc_id,
            json!({
                "title": format!("{doc_id} with photo"),
                "photo": blob_reference(&key, data.len() as u64),
            }),
        )
        .expect("Failed to put document with blob");
    key
}

/// Returns every document of a store keyed by ID.
pub fn documents<S: Store>(store: &S) -> BTreeMap<String, Document> {
    store
        .enumerate()
        .expect("Failed to enumerate documents")
        .map(|doc| doc.expect("Failed to read document"))
        .map(|doc| (doc.doc_id.clone(), doc))
        .collect()
}

/// Lists how two stores differ in replicated state.
///
/// Documents are compared by ID, current revision, public flags and
/// canonical body; every blob a document references must be present in both.
/// Sequences and local history depth are not compared.
pub fn compare_stores<A: Store, B: Store>(a: &A, b: &B) -> Vec<String> {
    let left = documents(a);
    let right = documents(b);
    let mut diffs = Vec::new();

    for (id, doc) in &left {
        let Some(other) = right.get(id) else {
            diffs.push(format!("{id}: missing from second store"));
            continue;
        };
        if doc.rev_id != other.rev_id {
            diffs.push(format!("{id}: revision {} != {}", doc.rev_id, other.rev_id));
        }
        if doc.flags != other.flags {
            diffs.push(format!("{id}: flags {:?} != {:?}", doc.flags, other.flags));
        }
        if canonical_body(&doc.body) != canonical_body(&other.body) {
            diffs.push(format!("{id}: bodies differ"));
        }
        for blob in find_blob_refs(&doc.body) {
            let here = a.blob_len(&blob.key).ok().flatten();
            let there = b.blob_len(&blob.key).ok().flatten();
            if here != there {
                diffs.push(format!("{id}: blob {} is {here:?} vs {there:?}", blob.key));
            }
        }
    }
    for id in right.keys().filter(|id| !left.contains_key(*id)) {
        diffs.push(format!("{id}: missing from first store"));
    }
    diffs
}

/// Panics with the list of differences unless two stores match.
pub fn assert_stores_match<A: Store, B: Store>(a: &A, b: &B) {
    let diffs = compare_stores(a, b);
    assert!(diffs.is_empty(), "stores differ:\n{}", diffs.join("\n"));
}
