//! crates/concierge_core/src/store/memory.rs
//!
//! An embedded in-process implementation of the [`DocumentStore`] port,
//! used by the test suites so the write paths can be exercised without a
//! database.
//!
//! Concurrency model: each document carries a version counter and each
//! collection a membership counter. A transaction records the versions it
//! observed while reading; commit re-checks them under the store lock and
//! rejects the commit if anything moved, after which the operation is re-run
//! from scratch. Merge writes (`apply`) take the lock once, so field-level
//! increments never lose updates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{
    apply_updates, DocPath, DocumentStore, FieldFilter, FieldUpdate, JsonMap, StoreError,
    StoreResult, StoreTransaction, TransactionOp,
};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
struct VersionedDoc {
    version: u64,
    data: JsonMap,
}

#[derive(Debug, Default)]
struct State {
    docs: HashMap<String, VersionedDoc>,
    /// Bumped whenever a collection gains or loses a document, so a
    /// transaction's query detects concurrently created or deleted rows.
    collections: HashMap<String, u64>,
}

impl State {
    fn doc_version(&self, path: &str) -> u64 {
        self.docs.get(path).map(|d| d.version).unwrap_or(0)
    }

    fn collection_version(&self, collection: &str) -> u64 {
        self.collections.get(collection).copied().unwrap_or(0)
    }

    fn bump_collection(&mut self, collection: &str) {
        *self.collections.entry(collection.to_string()).or_insert(0) += 1;
    }

    fn merge_into(&mut self, path: &DocPath, updates: &[FieldUpdate]) {
        if !self.docs.contains_key(path.as_str()) {
            self.bump_collection(path.collection());
        }
        let doc = self
            .docs
            .entry(path.as_str().to_string())
            .or_insert_with(|| VersionedDoc {
                version: 0,
                data: JsonMap::new(),
            });
        apply_updates(&mut doc.data, updates);
        doc.version += 1;
    }
}

/// The embedded store. Cloning shares the underlying state.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    max_attempts: u32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: Arc::new(Mutex::new(State::default())),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Overrides the commit retry budget. Mostly useful in tests that
    /// need contention to surface instead of being retried away.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        MemoryStore {
            state: Arc::new(Mutex::new(State::default())),
            max_attempts,
        }
    }

    fn locked(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))
    }
}

//=========================================================================================
// Transaction Handle
//=========================================================================================

enum StagedWrite {
    Set(DocPath, JsonMap),
    Update(DocPath, Vec<FieldUpdate>),
}

enum CommitOutcome {
    Committed,
    Conflict,
}

struct MemTransaction {
    state: Arc<Mutex<State>>,
    doc_reads: HashMap<String, u64>,
    collection_reads: HashMap<String, u64>,
    writes: Vec<StagedWrite>,
}

impl MemTransaction {
    fn new(state: Arc<Mutex<State>>) -> Self {
        MemTransaction {
            state,
            doc_reads: HashMap::new(),
            collection_reads: HashMap::new(),
            writes: Vec::new(),
        }
    }

    fn guard_reads(&self) -> StoreResult<()> {
        if self.writes.is_empty() {
            Ok(())
        } else {
            Err(StoreError::ReadAfterWrite)
        }
    }

    fn commit(self) -> StoreResult<CommitOutcome> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))?;

        for (path, observed) in &self.doc_reads {
            if state.doc_version(path) != *observed {
                return Ok(CommitOutcome::Conflict);
            }
        }
        for (collection, observed) in &self.collection_reads {
            if state.collection_version(collection) != *observed {
                return Ok(CommitOutcome::Conflict);
            }
        }

        for write in self.writes {
            match write {
                StagedWrite::Set(path, data) => {
                    if !state.docs.contains_key(path.as_str()) {
                        state.bump_collection(path.collection());
                    }
                    let doc = state
                        .docs
                        .entry(path.as_str().to_string())
                        .or_insert_with(|| VersionedDoc {
                            version: 0,
                            data: JsonMap::new(),
                        });
                    doc.data = data;
                    doc.version += 1;
                }
                StagedWrite::Update(path, updates) => {
                    let doc = state
                        .docs
                        .get_mut(path.as_str())
                        .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
                    apply_updates(&mut doc.data, &updates);
                    doc.version += 1;
                }
            }
        }
        Ok(CommitOutcome::Committed)
    }
}

#[async_trait]
impl StoreTransaction for MemTransaction {
    async fn get(&mut self, path: &DocPath) -> StoreResult<Option<JsonMap>> {
        self.guard_reads()?;
        let state = self
            .state
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))?;
        let version = state.doc_version(path.as_str());
        // First read wins: re-reading must not refresh the recorded version.
        self.doc_reads
            .entry(path.as_str().to_string())
            .or_insert(version);
        Ok(state.docs.get(path.as_str()).map(|d| d.data.clone()))
    }

    async fn query(&mut self, collection: &str, filter: &FieldFilter) -> StoreResult<Vec<JsonMap>> {
        self.guard_reads()?;
        let state = self
            .state
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))?;
        let collection_version = state.collection_version(collection);
        self.collection_reads
            .entry(collection.to_string())
            .or_insert(collection_version);

        let mut matches: Vec<(&String, &VersionedDoc)> = state
            .docs
            .iter()
            .filter(|(path, doc)| {
                DocPath::new(path.as_str()).collection() == collection && filter.matches(&doc.data)
            })
            .collect();
        matches.sort_by(|(pa, _), (pb, _)| pa.as_str().cmp(pb.as_str()));

        for (path, doc) in &matches {
            self.doc_reads
                .entry((*path).clone())
                .or_insert(doc.version);
        }
        Ok(matches.into_iter().map(|(_, doc)| doc.data.clone()).collect())
    }

    fn set(&mut self, path: &DocPath, data: JsonMap) -> StoreResult<()> {
        self.writes.push(StagedWrite::Set(path.clone(), data));
        Ok(())
    }

    fn update(&mut self, path: &DocPath, updates: Vec<FieldUpdate>) -> StoreResult<()> {
        self.writes.push(StagedWrite::Update(path.clone(), updates));
        Ok(())
    }
}

//=========================================================================================
// `DocumentStore` Implementation
//=========================================================================================

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn run_transaction(&self, op: &dyn TransactionOp) -> StoreResult<()> {
        for attempt in 1..=self.max_attempts {
            let mut tx = MemTransaction::new(self.state.clone());
            op.run(&mut tx).await?;
            match tx.commit()? {
                CommitOutcome::Committed => return Ok(()),
                CommitOutcome::Conflict => {
                    debug!(attempt, "transaction commit conflicted, re-running");
                }
            }
        }
        Err(StoreError::Contention(self.max_attempts))
    }

    async fn get(&self, path: &DocPath) -> StoreResult<Option<JsonMap>> {
        let state = self.locked()?;
        Ok(state.docs.get(path.as_str()).map(|d| d.data.clone()))
    }

    async fn query(&self, collection: &str, filter: &FieldFilter) -> StoreResult<Vec<JsonMap>> {
        let state = self.locked()?;
        let mut matches: Vec<(&String, &VersionedDoc)> = state
            .docs
            .iter()
            .filter(|(path, doc)| {
                DocPath::new(path.as_str()).collection() == collection && filter.matches(&doc.data)
            })
            .collect();
        matches.sort_by(|(pa, _), (pb, _)| pa.as_str().cmp(pb.as_str()));
        Ok(matches.into_iter().map(|(_, doc)| doc.data.clone()).collect())
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<(DocPath, JsonMap)>> {
        let state = self.locked()?;
        let mut entries: Vec<(DocPath, JsonMap)> = state
            .docs
            .iter()
            .filter(|(path, _)| DocPath::new(path.as_str()).collection() == collection)
            .map(|(path, doc)| (DocPath::new(path.as_str()), doc.data.clone()))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));
        Ok(entries)
    }

    async fn apply(&self, path: &DocPath, updates: Vec<FieldUpdate>) -> StoreResult<()> {
        let mut state = self.locked()?;
        state.merge_into(path, &updates);
        Ok(())
    }

    async fn apply_batch(&self, writes: Vec<(DocPath, Vec<FieldUpdate>)>) -> StoreResult<()> {
        let mut state = self.locked()?;
        for (path, updates) in &writes {
            state.merge_into(path, updates);
        }
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> StoreResult<()> {
        let mut state = self.locked()?;
        if state.docs.remove(path.as_str()).is_some() {
            state.bump_collection(path.collection());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn doc(pairs: &[(&str, Value)]) -> JsonMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    struct SetOp {
        path: DocPath,
        data: JsonMap,
    }

    #[async_trait]
    impl TransactionOp for SetOp {
        async fn run(&self, tx: &mut dyn StoreTransaction) -> StoreResult<()> {
            tx.set(&self.path, self.data.clone())?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = MemoryStore::new();
        let path = DocPath::new("properties/p1");
        store
            .run_transaction(&SetOp {
                path: path.clone(),
                data: doc(&[("name", json!("Villa"))]),
            })
            .await
            .unwrap();

        let fetched = store.get(&path).await.unwrap().unwrap();
        assert_eq!(fetched.get("name"), Some(&json!("Villa")));
    }

    struct ReadAfterWriteOp;

    #[async_trait]
    impl TransactionOp for ReadAfterWriteOp {
        async fn run(&self, tx: &mut dyn StoreTransaction) -> StoreResult<()> {
            tx.set(&DocPath::new("a/1"), JsonMap::new())?;
            tx.get(&DocPath::new("a/2")).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn reads_after_writes_are_rejected() {
        let store = MemoryStore::new();
        let err = store.run_transaction(&ReadAfterWriteOp).await.unwrap_err();
        assert!(matches!(err, StoreError::ReadAfterWrite));
    }

    /// Reads a counter, lets an interloper commit between read and commit
    /// on the first attempt, then writes the observed value + 1.
    struct ContendedIncrement {
        store: MemoryStore,
        path: DocPath,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl TransactionOp for ContendedIncrement {
        async fn run(&self, tx: &mut dyn StoreTransaction) -> StoreResult<()> {
            let current = tx
                .get(&self.path)
                .await?
                .and_then(|d| d.get("n").and_then(Value::as_i64))
                .unwrap_or(0);
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                self.store
                    .apply(&self.path, vec![FieldUpdate::increment("n", 10)])
                    .await?;
            }
            tx.set(&self.path, doc(&[("n", json!(current + 1))]))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn conflicting_commit_is_retried_with_fresh_reads() {
        let store = MemoryStore::new();
        let path = DocPath::new("properties/p1");
        let op = ContendedIncrement {
            store: store.clone(),
            path: path.clone(),
            attempts: AtomicU32::new(0),
        };

        store.run_transaction(&op).await.unwrap();

        // First attempt read 0 but the interloper moved the counter to 10,
        // so the retry must have observed 10 and written 11.
        assert_eq!(op.attempts.load(Ordering::SeqCst), 2);
        let n = store
            .get(&path)
            .await
            .unwrap()
            .and_then(|d| d.get("n").and_then(Value::as_i64));
        assert_eq!(n, Some(11));
    }

    struct AlwaysContended {
        store: MemoryStore,
        path: DocPath,
    }

    #[async_trait]
    impl TransactionOp for AlwaysContended {
        async fn run(&self, tx: &mut dyn StoreTransaction) -> StoreResult<()> {
            tx.get(&self.path).await?;
            self.store
                .apply(&self.path, vec![FieldUpdate::increment("n", 1)])
                .await?;
            tx.update(&self.path, vec![FieldUpdate::set("touched", json!(true))])?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn contention_surfaces_after_retry_budget() {
        let store = MemoryStore::with_max_attempts(2);
        let path = DocPath::new("properties/p1");
        store
            .apply(&path, vec![FieldUpdate::increment("n", 0)])
            .await
            .unwrap();

        let err = store
            .run_transaction(&AlwaysContended {
                store: store.clone(),
                path,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Contention(2)));
    }

    #[tokio::test]
    async fn update_on_missing_document_fails_the_transaction() {
        struct UpdateMissing;

        #[async_trait]
        impl TransactionOp for UpdateMissing {
            async fn run(&self, tx: &mut dyn StoreTransaction) -> StoreResult<()> {
                tx.update(
                    &DocPath::new("properties/ghost"),
                    vec![FieldUpdate::set("name", json!("x"))],
                )?;
                Ok(())
            }
        }

        let store = MemoryStore::new();
        let err = store.run_transaction(&UpdateMissing).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn query_sees_only_matching_documents_in_collection() {
        let store = MemoryStore::new();
        store
            .apply(
                &DocPath::new("properties/p1/reviews/r1"),
                vec![FieldUpdate::set("status", json!("published"))],
            )
            .await
            .unwrap();
        store
            .apply(
                &DocPath::new("properties/p1/reviews/r2"),
                vec![FieldUpdate::set("status", json!("pending"))],
            )
            .await
            .unwrap();
        store
            .apply(
                &DocPath::new("properties/p2/reviews/r3"),
                vec![FieldUpdate::set("status", json!("published"))],
            )
            .await
            .unwrap();

        let published = store
            .query(
                "properties/p1/reviews",
                &FieldFilter::equals("status", json!("published")),
            )
            .await
            .unwrap();
        assert_eq!(published.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_merge_increments_never_lose_updates() {
        let store = MemoryStore::new();
        let path = DocPath::new("properties/p1/faqUsage/counts");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                store
                    .apply(&path, vec![FieldUpdate::increment("faq1_count", 1)])
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let count = store
            .get(&path)
            .await
            .unwrap()
            .and_then(|d| d.get("faq1_count").and_then(Value::as_i64));
        assert_eq!(count, Some(32));
    }

    #[tokio::test]
    async fn delete_removes_document_and_changes_membership() {
        let store = MemoryStore::new();
        let path = DocPath::new("properties/p1/reviews/r1");
        store
            .apply(&path, vec![FieldUpdate::set("status", json!("published"))])
            .await
            .unwrap();
        store.delete(&path).await.unwrap();
        assert!(store.get(&path).await.unwrap().is_none());
        assert!(store
            .list("properties/p1/reviews")
            .await
            .unwrap()
            .is_empty());
    }
}
