//! crates/concierge_core/src/store/mod.rs
//!
//! The document store port: schemaless JSON documents addressed by
//! slash-separated paths, with atomic multi-document transactions,
//! field-level increments and order-preserving array-union appends.
//!
//! The transaction contract is snapshot-read + conditional-commit: all reads
//! must precede all writes in program order, and a commit is rejected and
//! the whole operation re-run if any document read by the transaction was
//! concurrently modified. Callers never retry by hand; the store runtime
//! does it (bounded), surfacing [`StoreError::Contention`] when it gives up.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// The schemaless payload of a single document.
pub type JsonMap = Map<String, Value>;

//=========================================================================================
// Errors
//=========================================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Transaction contention: gave up after {0} commit attempts")]
    Contention(u32),
    #[error("Transaction contract violation: all reads must precede writes")]
    ReadAfterWrite,
    #[error("Malformed document at {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

//=========================================================================================
// Paths, Filters and Field Updates
//=========================================================================================

/// A slash-separated document path, e.g. `properties/p1/reviews/r1`.
/// The final segment is the document id; everything before it is the
/// collection the document belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath(String);

impl DocPath {
    pub fn new(path: impl Into<String>) -> Self {
        DocPath(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The collection portion of the path (everything before the last `/`).
    pub fn collection(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }

    /// The document id (the last path segment).
    pub fn doc_id(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single-field equality filter for collection queries.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    pub field: String,
    pub equals: Value,
}

impl FieldFilter {
    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        FieldFilter {
            field: field.into(),
            equals: value,
        }
    }

    pub fn matches(&self, doc: &JsonMap) -> bool {
        doc.get(&self.field) == Some(&self.equals)
    }
}

/// A field-level mutation applied by [`StoreTransaction::update`] and by
/// merge writes outside transactions.
#[derive(Debug, Clone)]
pub enum FieldUpdate {
    /// Overwrite one field.
    Set(String, Value),
    /// Atomic numeric increment; a missing field counts from zero.
    Increment(String, i64),
    /// Order-preserving append of the items not already present in the
    /// array, compared by whole-value equality.
    ArrayUnion(String, Vec<Value>),
}

impl FieldUpdate {
    pub fn set(field: impl Into<String>, value: Value) -> Self {
        FieldUpdate::Set(field.into(), value)
    }

    pub fn increment(field: impl Into<String>, by: i64) -> Self {
        FieldUpdate::Increment(field.into(), by)
    }

    pub fn array_union(field: impl Into<String>, items: Vec<Value>) -> Self {
        FieldUpdate::ArrayUnion(field.into(), items)
    }
}

/// Applies a list of field updates to a document payload in place.
///
/// Shared by every store implementation so merge semantics never drift
/// between backends.
pub fn apply_updates(doc: &mut JsonMap, updates: &[FieldUpdate]) {
    for update in updates {
        match update {
            FieldUpdate::Set(field, value) => {
                doc.insert(field.clone(), value.clone());
            }
            FieldUpdate::Increment(field, by) => {
                let current = doc.get(field).and_then(Value::as_i64).unwrap_or(0);
                doc.insert(field.clone(), Value::from(current + by));
            }
            FieldUpdate::ArrayUnion(field, items) => {
                if !matches!(doc.get(field), Some(Value::Array(_))) {
                    doc.insert(field.clone(), Value::Array(Vec::new()));
                }
                if let Some(Value::Array(array)) = doc.get_mut(field) {
                    for item in items {
                        if !array.contains(item) {
                            array.push(item.clone());
                        }
                    }
                }
            }
        }
    }
}

//=========================================================================================
// Transaction and Store Ports
//=========================================================================================

/// The handle a [`TransactionOp`] runs against.
///
/// Reads (`get`, `query`) must all happen before the first staged write;
/// a read issued after `set`/`update` fails with
/// [`StoreError::ReadAfterWrite`]. Staged writes become visible atomically
/// when the transaction commits.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Reads one document, recording it in the transaction's read set.
    async fn get(&mut self, path: &DocPath) -> StoreResult<Option<JsonMap>>;

    /// Reads every document in `collection` matching `filter`, recording
    /// the result set (including its membership) in the read set.
    async fn query(&mut self, collection: &str, filter: &FieldFilter) -> StoreResult<Vec<JsonMap>>;

    /// Stages a full overwrite (create-or-replace) of one document.
    fn set(&mut self, path: &DocPath, data: JsonMap) -> StoreResult<()>;

    /// Stages field updates against an existing document. Committing an
    /// update against a missing document fails the transaction.
    fn update(&mut self, path: &DocPath, updates: Vec<FieldUpdate>) -> StoreResult<()>;
}

/// A retryable unit of transactional work. The store may run it several
/// times before one execution commits, so implementations must be safe to
/// re-run from scratch.
#[async_trait]
pub trait TransactionOp: Send + Sync {
    async fn run(&self, tx: &mut dyn StoreTransaction) -> StoreResult<()>;
}

/// The document store port.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Runs `op` inside one atomic transaction, retrying on contention.
    async fn run_transaction(&self, op: &dyn TransactionOp) -> StoreResult<()>;

    /// Reads one document outside any transaction.
    async fn get(&self, path: &DocPath) -> StoreResult<Option<JsonMap>>;

    /// Reads the matching documents of a collection outside any transaction.
    async fn query(&self, collection: &str, filter: &FieldFilter) -> StoreResult<Vec<JsonMap>>;

    /// Lists a whole collection as (path, payload) pairs.
    async fn list(&self, collection: &str) -> StoreResult<Vec<(DocPath, JsonMap)>>;

    /// A single-document merge write: creates the document when absent,
    /// then applies the updates atomically at field level. This is the
    /// lost-update-free increment path.
    async fn apply(&self, path: &DocPath, updates: Vec<FieldUpdate>) -> StoreResult<()>;

    /// Applies merge writes to many documents as one atomic batch.
    async fn apply_batch(&self, writes: Vec<(DocPath, Vec<FieldUpdate>)>) -> StoreResult<()>;

    /// Deletes one document. Deleting a missing document is a no-op.
    async fn delete(&self, path: &DocPath) -> StoreResult<()>;
}

/// Deserializes a document payload into a typed domain struct, mapping
/// shape mismatches to [`StoreError::Malformed`].
pub fn decode<T: serde::de::DeserializeOwned>(path: &DocPath, data: JsonMap) -> StoreResult<T> {
    serde_json::from_value(Value::Object(data)).map_err(|e| StoreError::Malformed {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Serializes a domain struct into a document payload.
pub fn encode<T: serde::Serialize>(value: &T) -> StoreResult<JsonMap> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Backend(format!(
            "expected a JSON object payload, got {other}"
        ))),
        Err(e) => Err(StoreError::Backend(e.to_string())),
    }
}
