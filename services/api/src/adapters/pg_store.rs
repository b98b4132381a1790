//! services/api/src/adapters/pg_store.rs
//!
//! This module contains the database adapter, which is the concrete
//! implementation of the `DocumentStore` port from the `core` crate. It
//! stores every document as a JSONB row in a single `documents` table,
//! keyed by its slash-separated path.
//!
//! Transactions take row locks as they read (`SELECT ... FOR UPDATE`), so
//! two transactions touching the same property serialize at the database
//! instead of conflicting at commit. Serialization failures and deadlocks
//! reported by Postgres at commit are retried like any other contended
//! commit.

use async_trait::async_trait;
use concierge_core::store::{
    apply_updates, DocPath, DocumentStore, FieldFilter, FieldUpdate, JsonMap, StoreError,
    StoreResult, StoreTransaction, TransactionOp,
};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A database adapter that implements the `DocumentStore` port.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    max_attempts: u32,
}

impl PgDocumentStore {
    /// Creates a new `PgDocumentStore`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn row_to_map(path: &str, data: Value) -> StoreResult<JsonMap> {
    match data {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Malformed {
            path: path.to_string(),
            reason: format!("expected a JSON object, got {other}"),
        }),
    }
}

/// Postgres retries: serialization failure (40001) and deadlock (40P01).
fn is_retryable(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "40001" || code == "40P01")
        .unwrap_or(false)
}

//=========================================================================================
// Transaction Handle
//=========================================================================================

enum StagedWrite {
    Set(DocPath, JsonMap),
    Update(DocPath, Vec<FieldUpdate>),
}

enum CommitError {
    NotFound(String),
    Sqlx(sqlx::Error),
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
    writes: Vec<StagedWrite>,
}

impl PgTransaction {
    fn guard_reads(&self) -> StoreResult<()> {
        if self.writes.is_empty() {
            Ok(())
        } else {
            Err(StoreError::ReadAfterWrite)
        }
    }

    async fn commit(mut self) -> Result<(), CommitError> {
        for write in std::mem::take(&mut self.writes) {
            match write {
                StagedWrite::Set(path, data) => {
                    upsert(&mut self.tx, &path, Value::Object(data))
                        .await
                        .map_err(CommitError::Sqlx)?;
                }
                StagedWrite::Update(path, updates) => {
                    let row = sqlx::query("SELECT data FROM documents WHERE path = $1 FOR UPDATE")
                        .bind(path.as_str())
                        .fetch_optional(&mut *self.tx)
                        .await
                        .map_err(CommitError::Sqlx)?;
                    let Some(row) = row else {
                        return Err(CommitError::NotFound(path.to_string()));
                    };
                    let mut data = match row.try_get::<Value, _>("data") {
                        Ok(Value::Object(map)) => map,
                        Ok(_) => JsonMap::new(),
                        Err(e) => return Err(CommitError::Sqlx(e)),
                    };
                    apply_updates(&mut data, &updates);
                    upsert(&mut self.tx, &path, Value::Object(data))
                        .await
                        .map_err(CommitError::Sqlx)?;
                }
            }
        }
        self.tx.commit().await.map_err(CommitError::Sqlx)
    }
}

async fn upsert(
    tx: &mut Transaction<'static, Postgres>,
    path: &DocPath,
    data: Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO documents (path, collection, data) VALUES ($1, $2, $3) \
         ON CONFLICT (path) DO UPDATE \
         SET data = EXCLUDED.data, version = documents.version + 1, updated_at = now()",
    )
    .bind(path.as_str())
    .bind(path.collection())
    .bind(data)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn get(&mut self, path: &DocPath) -> StoreResult<Option<JsonMap>> {
        self.guard_reads()?;
        let row = sqlx::query("SELECT data FROM documents WHERE path = $1 FOR UPDATE")
            .bind(path.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => {
                let data: Value = row.try_get("data").map_err(backend)?;
                Ok(Some(row_to_map(path.as_str(), data)?))
            }
            None => Ok(None),
        }
    }

    async fn query(&mut self, collection: &str, filter: &FieldFilter) -> StoreResult<Vec<JsonMap>> {
        self.guard_reads()?;
        let rows = sqlx::query(
            "SELECT path, data FROM documents \
             WHERE collection = $1 AND data->$2 = $3 \
             ORDER BY path FOR UPDATE",
        )
        .bind(collection)
        .bind(&filter.field)
        .bind(&filter.equals)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let path: String = row.try_get("path").map_err(backend)?;
                let data: Value = row.try_get("data").map_err(backend)?;
                row_to_map(&path, data)
            })
            .collect()
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
// `DocumentStore` Trait Implementation
//=========================================================================================

async fn merge_one(
    tx: &mut Transaction<'static, Postgres>,
    path: &DocPath,
    updates: &[FieldUpdate],
) -> Result<(), sqlx::Error> {
    let row = sqlx::query("SELECT data FROM documents WHERE path = $1 FOR UPDATE")
        .bind(path.as_str())
        .fetch_optional(&mut **tx)
        .await?;
    let mut data = match row {
        Some(row) => match row.try_get::<Value, _>("data")? {
            Value::Object(map) => map,
            _ => JsonMap::new(),
        },
        None => JsonMap::new(),
    };
    apply_updates(&mut data, updates);
    upsert(tx, path, Value::Object(data)).await
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn run_transaction(&self, op: &dyn TransactionOp) -> StoreResult<()> {
        for attempt in 1..=self.max_attempts {
            let tx = self.pool.begin().await.map_err(backend)?;
            let mut pg_tx = PgTransaction {
                tx,
                writes: Vec::new(),
            };
            // An op error aborts; the dropped transaction rolls back.
            op.run(&mut pg_tx).await?;
            match pg_tx.commit().await {
                Ok(()) => return Ok(()),
                Err(CommitError::NotFound(path)) => return Err(StoreError::NotFound(path)),
                Err(CommitError::Sqlx(e)) if is_retryable(&e) && attempt < self.max_attempts => {
                    debug!(attempt, "postgres transaction conflicted, re-running");
                }
                Err(CommitError::Sqlx(e)) => return Err(backend(e)),
            }
        }
        Err(StoreError::Contention(self.max_attempts))
    }

    async fn get(&self, path: &DocPath) -> StoreResult<Option<JsonMap>> {
        let row = sqlx::query("SELECT data FROM documents WHERE path = $1")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => {
                let data: Value = row.try_get("data").map_err(backend)?;
                Ok(Some(row_to_map(path.as_str(), data)?))
            }
            None => Ok(None),
        }
    }

    async fn query(&self, collection: &str, filter: &FieldFilter) -> StoreResult<Vec<JsonMap>> {
        let rows = sqlx::query(
            "SELECT path, data FROM documents WHERE collection = $1 AND data->$2 = $3 ORDER BY path",
        )
        .bind(collection)
        .bind(&filter.field)
        .bind(&filter.equals)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let path: String = row.try_get("path").map_err(backend)?;
                let data: Value = row.try_get("data").map_err(backend)?;
                row_to_map(&path, data)
            })
            .collect()
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<(DocPath, JsonMap)>> {
        let rows = sqlx::query("SELECT path, data FROM documents WHERE collection = $1 ORDER BY path")
            .bind(collection)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let path: String = row.try_get("path").map_err(backend)?;
                let data: Value = row.try_get("data").map_err(backend)?;
                let map = row_to_map(&path, data)?;
                Ok((DocPath::new(path), map))
            })
            .collect()
    }

    async fn apply(&self, path: &DocPath, updates: Vec<FieldUpdate>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        merge_one(&mut tx, path, &updates).await.map_err(backend)?;
        tx.commit().await.map_err(backend)
    }

    async fn apply_batch(&self, writes: Vec<(DocPath, Vec<FieldUpdate>)>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for (path, updates) in &writes {
            merge_one(&mut tx, path, updates).await.map_err(backend)?;
        }
        tx.commit().await.map_err(backend)
    }

    async fn delete(&self, path: &DocPath) -> StoreResult<()> {
        sqlx::query("DELETE FROM documents WHERE path = $1")
            .bind(path.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
