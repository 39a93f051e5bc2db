//! Storage abstractions for Memory Agent.
//!
//! Three durable collaborators back the engine:
//!
//! | Trait | Holds | Adapters |
//! |-------|-------|----------|
//! | [`ObjectStore`] | document content + chunks, one object per version | filesystem, S3, in-memory |
//! | [`IndexStore`] | queryable [`IndexEntry`] per live document | SQLite, in-memory |
//! | [`WorkflowJournal`] | [`WorkflowExecution`] snapshots | SQLite, in-memory |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! Transient failures (network, locks) are reported as
//! [`MemoryError::Transient`](crate::error::MemoryError::Transient) so the
//! policy engine can retry them.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::MemoryResult;
use crate::filter::MetadataFilter;
use crate::models::IndexEntry;
use crate::workflow::WorkflowExecution;

/// Outcome of a create-only write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    /// The key already existed; nothing was written.
    Exists,
}

/// Durable key/value blob storage.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`put`](ObjectStore::put) | Write or overwrite an object |
/// | [`put_if_absent`](ObjectStore::put_if_absent) | Create-only write; the version CAS primitive |
/// | [`get`](ObjectStore::get) | Read an object, `None` if absent |
/// | [`list`](ObjectStore::list) | Keys under a prefix, sorted |
/// | [`delete`](ObjectStore::delete) | Remove an object (absent is not an error) |
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> MemoryResult<()>;

    /// Write only if `key` does not exist. Two concurrent calls for the same
    /// key must resolve to exactly one `Created`.
    async fn put_if_absent(&self, key: &str, body: Vec<u8>) -> MemoryResult<PutOutcome>;

    async fn get(&self, key: &str) -> MemoryResult<Option<Vec<u8>>>;

    async fn list(&self, prefix: &str) -> MemoryResult<Vec<String>>;

    async fn delete(&self, key: &str) -> MemoryResult<()>;
}

/// Queryable metadata index, one entry per live document.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert or update an entry. An entry never regresses to an older
    /// version, and access statistics survive updates.
    async fn upsert(&self, entry: &IndexEntry) -> MemoryResult<()>;

    async fn get(&self, document_id: &str) -> MemoryResult<Option<IndexEntry>>;

    async fn remove(&self, document_id: &str) -> MemoryResult<()>;

    /// Entries matching `filter`, most recently updated first, at most
    /// `limit` of them.
    async fn query(&self, filter: &MetadataFilter, limit: usize) -> MemoryResult<Vec<IndexEntry>>;

    /// Bump `access_count` and set `last_accessed_at`. Unknown ids are ignored.
    async fn record_access(&self, document_id: &str, at: DateTime<Utc>) -> MemoryResult<()>;

    /// All indexed entries, used by reconciliation.
    async fn list(&self) -> MemoryResult<Vec<IndexEntry>>;
}

/// Durable log of workflow executions, written after every transition.
#[async_trait]
pub trait WorkflowJournal: Send + Sync {
    async fn save(&self, execution: &WorkflowExecution) -> MemoryResult<()>;

    async fn load(&self, id: Uuid) -> MemoryResult<Option<WorkflowExecution>>;

    /// Executions not yet in a terminal state, oldest first.
    async fn list_unfinished(&self) -> MemoryResult<Vec<WorkflowExecution>>;
}
