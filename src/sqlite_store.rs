//! SQLite adapters for the index, the workflow journal, and the embedding
//! cache.
//!
//! All three share one pool opened by [`db::connect`](crate::db::connect)
//! and the tables created by [`migrate::apply`](crate::migrate::apply).
//! Timestamps are stored as Unix milliseconds. Database errors are reported
//! as transient so the policy engine retries them.
//!
//! Metadata filters are evaluated in Rust over the decoded rows rather than
//! compiled to SQL, so the SQLite index and the in-memory index share one
//! set of predicate semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use memory_agent_core::embedding::{blob_to_vec, vec_to_blob, EmbeddingCache};
use memory_agent_core::filter::MetadataFilter;
use memory_agent_core::models::{IndexEntry, Metadata};
use memory_agent_core::store::{IndexStore, WorkflowJournal};
use memory_agent_core::workflow::WorkflowExecution;
use memory_agent_core::{MemoryError, MemoryResult};

fn db_error(err: sqlx::Error) -> MemoryError {
    MemoryError::transient(format!("sqlite: {err}"))
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> MemoryResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| MemoryError::internal(format!("timestamp out of range: {ms}")))
}

/// [`IndexStore`] over the `index_entries` table.
#[derive(Clone)]
pub struct SqliteIndexStore {
    pool: SqlitePool,
}

impl SqliteIndexStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn entry_from_row(row: &SqliteRow) -> MemoryResult<IndexEntry> {
        let metadata_json: String = row.get("metadata_json");
        let metadata: Metadata = serde_json::from_str(&metadata_json)
            .map_err(|e| MemoryError::internal(format!("corrupt metadata_json: {e}")))?;
        let format: String = row.get("format");
        let last_accessed_at: Option<i64> = row.get("last_accessed_at");
        let version: i64 = row.get("version");
        let token_count: i64 = row.get("token_count");
        let access_count: i64 = row.get("access_count");

        Ok(IndexEntry {
            document_id: row.get("document_id"),
            version: version as u64,
            format: format.parse()?,
            metadata,
            token_count: token_count as usize,
            created_at: from_millis(row.get("created_at"))?,
            updated_at: from_millis(row.get("updated_at"))?,
            last_accessed_at: last_accessed_at.map(from_millis).transpose()?,
            access_count: access_count as u64,
        })
    }

    async fn all_entries(&self) -> MemoryResult<Vec<IndexEntry>> {
        let rows = sqlx::query(
            "SELECT document_id, version, format, metadata_json, token_count, created_at, updated_at, last_accessed_at, access_count \
             FROM index_entries ORDER BY updated_at DESC, document_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::entry_from_row).collect()
    }
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn upsert(&self, entry: &IndexEntry) -> MemoryResult<()> {
        let metadata_json = serde_json::to_string(&entry.metadata)
            .map_err(|e| MemoryError::internal(format!("metadata encode: {e}")))?;

        // Access statistics are left untouched on update, and an older
        // version never overwrites a newer one.
        sqlx::query(
            r#"
            INSERT INTO index_entries (document_id, version, format, metadata_json, token_count, created_at, updated_at, last_accessed_at, access_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, 0)
            ON CONFLICT(document_id) DO UPDATE SET
                version = excluded.version,
                format = excluded.format,
                metadata_json = excluded.metadata_json,
                token_count = excluded.token_count,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            WHERE excluded.version >= index_entries.version
            "#,
        )
        .bind(&entry.document_id)
        .bind(entry.version as i64)
        .bind(entry.format.as_str())
        .bind(&metadata_json)
        .bind(entry.token_count as i64)
        .bind(to_millis(entry.created_at))
        .bind(to_millis(entry.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn get(&self, document_id: &str) -> MemoryResult<Option<IndexEntry>> {
        let row = sqlx::query(
            "SELECT document_id, version, format, metadata_json, token_count, created_at, updated_at, last_accessed_at, access_count \
             FROM index_entries WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn remove(&self, document_id: &str) -> MemoryResult<()> {
        sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn query(&self, filter: &MetadataFilter, limit: usize) -> MemoryResult<Vec<IndexEntry>> {
        let mut matched = self.all_entries().await?;
        matched.retain(|e| filter.matches(&e.metadata));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn record_access(&self, document_id: &str, at: DateTime<Utc>) -> MemoryResult<()> {
        sqlx::query(
            "UPDATE index_entries SET access_count = access_count + 1, last_accessed_at = ? WHERE document_id = ?",
        )
        .bind(to_millis(at))
        .bind(document_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn list(&self) -> MemoryResult<Vec<IndexEntry>> {
        let mut all = self.all_entries().await?;
        all.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(all)
    }
}

/// [`WorkflowJournal`] storing each execution as one JSON row.
#[derive(Clone)]
pub struct SqliteJournal {
    pool: SqlitePool,
}

impl SqliteJournal {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn decode(body: &str) -> MemoryResult<WorkflowExecution> {
        serde_json::from_str(body)
            .map_err(|e| MemoryError::internal(format!("corrupt workflow journal row: {e}")))
    }
}

#[async_trait]
impl WorkflowJournal for SqliteJournal {
    async fn save(&self, execution: &WorkflowExecution) -> MemoryResult<()> {
        let body = serde_json::to_string(execution)
            .map_err(|e| MemoryError::internal(format!("workflow encode: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_executions (id, kind, state, finished, body_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                finished = excluded.finished,
                body_json = excluded.body_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.kind.to_string())
        .bind(execution.state.to_string())
        .bind(execution.is_finished())
        .bind(&body)
        .bind(to_millis(execution.created_at))
        .bind(to_millis(execution.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn load(&self, id: Uuid) -> MemoryResult<Option<WorkflowExecution>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body_json FROM workflow_executions WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        body.as_deref().map(Self::decode).transpose()
    }

    async fn list_unfinished(&self) -> MemoryResult<Vec<WorkflowExecution>> {
        let rows = sqlx::query(
            "SELECT body_json FROM workflow_executions WHERE finished = 0 ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                let body: String = row.get("body_json");
                Self::decode(&body)
            })
            .collect()
    }
}

/// [`EmbeddingCache`] over the `chunk_embeddings` table.
#[derive(Clone)]
pub struct SqliteEmbeddingCache {
    pool: SqlitePool,
}

impl SqliteEmbeddingCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmbeddingCache for SqliteEmbeddingCache {
    async fn get(&self, content_hash: &str, model_version: &str) -> MemoryResult<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT vector FROM chunk_embeddings WHERE content_hash = ? AND model_version = ?",
        )
        .bind(content_hash)
        .bind(model_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    async fn put(&self, content_hash: &str, model_version: &str, vector: &[f32]) -> MemoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_embeddings (content_hash, model_version, dims, vector, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(content_hash, model_version) DO UPDATE SET
                dims = excluded.dims,
                vector = excluded.vector,
                created_at = excluded.created_at
            "#,
        )
        .bind(content_hash)
        .bind(model_version)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}
