//! In-memory store implementations for tests and embedded use.
//!
//! Each store keeps its data behind a `std::sync::RwLock`. A poisoned lock
//! is recovered rather than propagated: every write replaces whole values,
//! so a panic mid-write cannot leave partial state behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::embedding::EmbeddingCache;
use crate::error::MemoryResult;
use crate::filter::MetadataFilter;
use crate::models::IndexEntry;
use crate::workflow::WorkflowExecution;

use super::{IndexStore, ObjectStore, PutOutcome, WorkflowJournal};

/// Object store over a sorted map.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> MemoryResult<()> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, body: Vec<u8>) -> MemoryResult<PutOutcome> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        if objects.contains_key(key) {
            return Ok(PutOutcome::Exists);
        }
        objects.insert(key.to_string(), body);
        Ok(PutOutcome::Created)
    }

    async fn get(&self, key: &str) -> MemoryResult<Option<Vec<u8>>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> MemoryResult<Vec<String>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> MemoryResult<()> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.remove(key);
        Ok(())
    }
}

/// Metadata index over a hash map; filters are evaluated by scanning.
#[derive(Default)]
pub struct InMemoryIndexStore {
    entries: RwLock<HashMap<String, IndexEntry>>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn upsert(&self, entry: &IndexEntry) -> MemoryResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(&entry.document_id) {
            Some(existing) if existing.version > entry.version => {}
            Some(existing) => {
                let access_count = existing.access_count;
                let last_accessed_at = existing.last_accessed_at;
                *existing = entry.clone();
                existing.access_count = access_count;
                existing.last_accessed_at = last_accessed_at;
            }
            None => {
                entries.insert(entry.document_id.clone(), entry.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, document_id: &str) -> MemoryResult<Option<IndexEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(document_id).cloned())
    }

    async fn remove(&self, document_id: &str) -> MemoryResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(document_id);
        Ok(())
    }

    async fn query(&self, filter: &MetadataFilter, limit: usize) -> MemoryResult<Vec<IndexEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<IndexEntry> = entries
            .values()
            .filter(|e| filter.matches(&e.metadata))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        matched.truncate(limit);
        Ok(matched)
    }

    async fn record_access(&self, document_id: &str, at: DateTime<Utc>) -> MemoryResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(document_id) {
            entry.access_count += 1;
            entry.last_accessed_at = Some(at);
        }
        Ok(())
    }

    async fn list(&self) -> MemoryResult<Vec<IndexEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<IndexEntry> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(all)
    }
}

/// Workflow journal over a hash map.
#[derive(Default)]
pub struct InMemoryJournal {
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowJournal for InMemoryJournal {
    async fn save(&self, execution: &WorkflowExecution) -> MemoryResult<()> {
        let mut executions = self.executions.write().unwrap_or_else(PoisonError::into_inner);
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> MemoryResult<Option<WorkflowExecution>> {
        let executions = self.executions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(executions.get(&id).cloned())
    }

    async fn list_unfinished(&self) -> MemoryResult<Vec<WorkflowExecution>> {
        let executions = self.executions.read().unwrap_or_else(PoisonError::into_inner);
        let mut unfinished: Vec<WorkflowExecution> = executions
            .values()
            .filter(|e| !e.is_finished())
            .cloned()
            .collect();
        unfinished.sort_by_key(|e| e.created_at);
        Ok(unfinished)
    }
}

/// Embedding cache over a hash map keyed by `(content_hash, model_version)`.
#[derive(Default)]
pub struct InMemoryEmbeddingCache {
    vectors: RwLock<HashMap<(String, String), Vec<f32>>>,
}

impl InMemoryEmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EmbeddingCache for InMemoryEmbeddingCache {
    async fn get(&self, content_hash: &str, model_version: &str) -> MemoryResult<Option<Vec<f32>>> {
        let vectors = self.vectors.read().unwrap_or_else(PoisonError::into_inner);
        Ok(vectors
            .get(&(content_hash.to_string(), model_version.to_string()))
            .cloned())
    }

    async fn put(&self, content_hash: &str, model_version: &str, vector: &[f32]) -> MemoryResult<()> {
        let mut vectors = self.vectors.write().unwrap_or_else(PoisonError::into_inner);
        vectors.insert(
            (content_hash.to_string(), model_version.to_string()),
            vector.to_vec(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, DocumentFormat, Metadata, MetadataValue};

    fn entry(id: &str, version: u64, team: &str) -> IndexEntry {
        let mut meta = Metadata::new();
        meta.insert("team".into(), MetadataValue::from(team));
        let mut doc = Document::new(id, "x", DocumentFormat::Markdown, meta);
        doc.version = version;
        IndexEntry::from_document(&doc)
    }

    #[tokio::test]
    async fn test_put_if_absent_single_winner() {
        let store = InMemoryObjectStore::new();
        assert_eq!(
            store.put_if_absent("k", b"a".to_vec()).await.unwrap(),
            PutOutcome::Created
        );
        assert_eq!(
            store.put_if_absent("k", b"b".to_vec()).await.unwrap(),
            PutOutcome::Exists
        );
        assert_eq!(store.get("k").await.unwrap().unwrap(), b"a".to_vec());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = InMemoryObjectStore::new();
        for key in ["documents/a/v1", "documents/a/v2", "documents/ab/v1", "other"] {
            store.put(key, Vec::new()).await.unwrap();
        }
        let keys = store.list("documents/a/").await.unwrap();
        assert_eq!(keys, vec!["documents/a/v1", "documents/a/v2"]);
    }

    #[tokio::test]
    async fn test_index_never_regresses_and_keeps_access_stats() {
        let index = InMemoryIndexStore::new();
        index.upsert(&entry("d", 2, "infra")).await.unwrap();
        index.record_access("d", Utc::now()).await.unwrap();
        index.upsert(&entry("d", 1, "old")).await.unwrap();

        let got = index.get("d").await.unwrap().unwrap();
        assert_eq!(got.version, 2);
        assert_eq!(got.access_count, 1);

        index.upsert(&entry("d", 3, "core")).await.unwrap();
        let got = index.get("d").await.unwrap().unwrap();
        assert_eq!(got.version, 3);
        assert_eq!(got.access_count, 1);
        assert!(got.last_accessed_at.is_some());
    }

    #[tokio::test]
    async fn test_index_query_filters() {
        let index = InMemoryIndexStore::new();
        index.upsert(&entry("a", 1, "infra")).await.unwrap();
        index.upsert(&entry("b", 1, "web")).await.unwrap();
        let hits = index
            .query(&MetadataFilter::eq("team", "web"), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "b");
    }

    #[tokio::test]
    async fn test_embedding_cache_keyed_by_model() {
        let cache = InMemoryEmbeddingCache::new();
        cache.put("h", "m1", &[1.0, 2.0]).await.unwrap();
        assert_eq!(cache.get("h", "m1").await.unwrap(), Some(vec![1.0, 2.0]));
        assert_eq!(cache.get("h", "m2").await.unwrap(), None);
    }
}
