//! Storage coordinator: the only component that writes documents.
//!
//! Coordinates the object store (durable content and chunks, one object per
//! revision) and the index store (queryable metadata for live documents).
//!
//! # Put protocol
//!
//! 1. **Validate**: id charset `[A-Za-z0-9_.-]`, size limit, JSON parses
//!    for `json` documents, metadata keys non-empty and lists flat.
//! 2. **Prepare**: chunk the content and assign `version = base + 1`.
//! 3. **Persist**: create-only write of `documents/{id}/v{version}.json`.
//!    If the latest stored version is not `base`, or another writer created
//!    the key first, the put is a conflict, unless the existing revision is
//!    identical (an idempotent replay), which returns the existing version.
//! 4. **Index**: upsert the [`IndexEntry`]. Retried independently of
//!    persist; a document that is durable but not indexed is repaired by
//!    [`reconcile`](StorageCoordinator::reconcile).
//!
//! Deletion writes a tombstone revision (`is_deleted = true`) through the
//! same protocol and removes the index entry. [`purge`](StorageCoordinator::purge)
//! physically removes every revision.
//!
//! # Revision cache
//!
//! Decoded revisions are kept in a bounded in-process cache keyed by
//! `(id, version)` with a time-to-live. A revision is immutable once
//! written, so reads of `get` and `candidates` are served from the cache;
//! persist and purge drop the keys they touch. The version listing is never
//! cached, so the latest version is always read from the object store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moka::sync::Cache;
use serde::Serialize;
use tracing::{debug, info, warn};

use memory_agent_core::chunk::{self, TOKENIZER_VERSION};
use memory_agent_core::filter::MetadataFilter;
use memory_agent_core::models::{
    CandidateSet, Document, DocumentFormat, IndexEntry, MetadataValue, StoredDocument,
};
use memory_agent_core::store::{IndexStore, ObjectStore, PutOutcome};
use memory_agent_core::{MemoryError, MemoryResult};

use crate::object_store::{document_prefix, object_key, parse_object_key, DOCUMENTS_PREFIX};

/// Limits applied by the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct StorageLimits {
    pub max_tokens_per_chunk: usize,
    pub max_document_bytes: usize,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            max_tokens_per_chunk: chunk::DEFAULT_MAX_TOKENS_PER_CHUNK,
            max_document_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Bounds for the revision cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheSettings {
    /// Revisions kept at most. `0` disables the cache.
    pub max_entries: u64,
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            ttl: Duration::from_secs(3_600),
        }
    }
}

type RevisionKey = (String, u64);

/// Result of the persist step.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    /// A new revision was written.
    Written(StoredDocument),
    /// An identical revision already existed; nothing was written.
    Replayed(StoredDocument),
}

impl PersistOutcome {
    pub fn stored(&self) -> &StoredDocument {
        match self {
            PersistOutcome::Written(s) | PersistOutcome::Replayed(s) => s,
        }
    }

    pub fn into_stored(self) -> StoredDocument {
        match self {
            PersistOutcome::Written(s) | PersistOutcome::Replayed(s) => s,
        }
    }
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Documents found in the object store.
    pub scanned: usize,
    /// Ids whose index entry was missing or stale and has been upserted.
    pub repaired: Vec<String>,
    /// Ids whose index entry was removed (deleted or purged documents).
    pub removed: Vec<String>,
    /// Per-document failures, retried on the next pass.
    pub errors: Vec<String>,
}

pub struct StorageCoordinator {
    objects: Arc<dyn ObjectStore>,
    index: Arc<dyn IndexStore>,
    limits: StorageLimits,
    revisions: Option<Cache<RevisionKey, Arc<StoredDocument>>>,
}

fn revision_cache(settings: CacheSettings) -> Option<Cache<RevisionKey, Arc<StoredDocument>>> {
    (settings.max_entries > 0).then(|| {
        Cache::builder()
            .max_capacity(settings.max_entries)
            .time_to_live(settings.ttl)
            .build()
    })
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 255
        && id != "."
        && id != ".."
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Two revisions carry the same payload.
fn same_revision(a: &Document, b: &Document) -> bool {
    a.format == b.format
        && a.metadata == b.metadata
        && a.is_deleted == b.is_deleted
        && chunk::content_hash(&a.content) == chunk::content_hash(&b.content)
}

impl StorageCoordinator {
    pub fn new(objects: Arc<dyn ObjectStore>, index: Arc<dyn IndexStore>, limits: StorageLimits) -> Self {
        Self {
            objects,
            index,
            limits,
            revisions: revision_cache(CacheSettings::default()),
        }
    }

    /// Replace the revision cache with one bounded by `settings`.
    pub fn with_cache(mut self, settings: CacheSettings) -> Self {
        self.revisions = revision_cache(settings);
        self
    }

    pub fn limits(&self) -> StorageLimits {
        self.limits
    }

    fn cached(&self, document_id: &str, version: u64) -> Option<StoredDocument> {
        let hit = self.revisions.as_ref()?.get(&(document_id.to_string(), version))?;
        debug!(document_id, version, "Revision cache hit");
        Some(StoredDocument::clone(&hit))
    }

    fn remember(&self, stored: &StoredDocument) {
        if let Some(cache) = &self.revisions {
            let key = (stored.document.id.clone(), stored.document.version);
            cache.insert(key, Arc::new(stored.clone()));
        }
    }

    fn forget(&self, document_id: &str, version: u64) {
        if let Some(cache) = &self.revisions {
            cache.invalidate(&(document_id.to_string(), version));
        }
    }

    /// Reject malformed documents before anything is written.
    pub fn validate(&self, doc: &Document) -> MemoryResult<()> {
        if !is_valid_id(&doc.id) {
            return Err(MemoryError::validation(format!(
                "invalid document id '{}': use 1-255 characters from [A-Za-z0-9_.-]",
                doc.id
            )));
        }
        if doc.content.len() > self.limits.max_document_bytes {
            return Err(MemoryError::validation(format!(
                "document '{}' is {} bytes, over the {}-byte limit",
                doc.id,
                doc.content.len(),
                self.limits.max_document_bytes
            )));
        }
        if doc.format == DocumentFormat::Json {
            if let Err(e) = serde_json::from_str::<serde_json::Value>(&doc.content) {
                return Err(MemoryError::validation(format!(
                    "document '{}' is not valid JSON: {e}",
                    doc.id
                )));
            }
        }
        for (key, value) in &doc.metadata {
            if key.trim().is_empty() {
                return Err(MemoryError::validation("metadata keys must not be empty"));
            }
            if let MetadataValue::List(items) = value {
                if !items.iter().all(MetadataValue::is_scalar) {
                    return Err(MemoryError::validation(format!(
                        "metadata '{key}' nests a list; only flat lists are allowed"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Chunk `doc` and stamp the revision it will be written as.
    ///
    /// `doc.version` is the caller's base version; the result carries
    /// `base + 1`.
    pub fn prepare(&self, mut doc: Document) -> MemoryResult<StoredDocument> {
        let chunks = chunk::build_chunks(&doc.id, &doc.content, self.limits.max_tokens_per_chunk)?;
        doc.token_count = chunks.iter().map(|c| c.token_count).sum();
        doc.tokenizer_version = TOKENIZER_VERSION;
        doc.version = doc
            .version
            .checked_add(1)
            .ok_or_else(|| MemoryError::validation("base version out of range"))?;
        doc.updated_at = Utc::now();
        Ok(StoredDocument {
            document: doc,
            chunks,
        })
    }

    /// Highest stored version of `document_id`, if any revision exists.
    pub async fn latest_version(&self, document_id: &str) -> MemoryResult<Option<u64>> {
        let keys = self.objects.list(&document_prefix(document_id)).await?;
        Ok(keys
            .iter()
            .filter_map(|k| parse_object_key(k))
            .filter(|(id, _)| *id == document_id)
            .map(|(_, v)| v)
            .max())
    }

    /// Write a prepared revision with create-only semantics.
    pub async fn persist(&self, prepared: &StoredDocument) -> MemoryResult<PersistOutcome> {
        let doc = &prepared.document;
        let target = doc.version;
        let base = target.saturating_sub(1);

        let latest = self.latest_version(&doc.id).await?.unwrap_or(0);
        if latest != base {
            return self.replay_or_conflict(prepared, base, latest).await;
        }

        let body = serde_json::to_vec(prepared)
            .map_err(|e| MemoryError::internal(format!("encode document: {e}")))?;
        self.forget(&doc.id, target);
        match self.objects.put_if_absent(&object_key(&doc.id, target), body).await? {
            PutOutcome::Created => {
                info!(document_id = %doc.id, version = target, chunks = prepared.chunks.len(), "Persisted revision");
                self.remember(prepared);
                Ok(PersistOutcome::Written(prepared.clone()))
            }
            PutOutcome::Exists => self.replay_or_conflict(prepared, base, target).await,
        }
    }

    async fn replay_or_conflict(
        &self,
        prepared: &StoredDocument,
        base: u64,
        found: u64,
    ) -> MemoryResult<PersistOutcome> {
        let doc = &prepared.document;
        if found == base + 1 {
            if let Some(existing) = self.load_version(&doc.id, found).await? {
                if same_revision(&existing.document, doc) {
                    debug!(document_id = %doc.id, version = found, "Idempotent replay of stored revision");
                    return Ok(PersistOutcome::Replayed(existing));
                }
            }
        }
        Err(MemoryError::Conflict {
            document_id: doc.id.clone(),
            expected: base,
            found,
        })
    }

    /// Bring the index in line with a stored revision.
    pub async fn update_index(&self, doc: &Document) -> MemoryResult<()> {
        if doc.is_deleted {
            self.index.remove(&doc.id).await
        } else {
            self.index.upsert(&IndexEntry::from_document(doc)).await
        }
    }

    /// Validate, persist, and index in one call, without workflow tracking.
    /// Returns the `(id, version)` now stored.
    pub async fn put(&self, doc: Document) -> MemoryResult<(String, u64)> {
        self.validate(&doc)?;
        let prepared = self.prepare(doc)?;
        let stored = self.persist(&prepared).await?.into_stored();
        self.update_index(&stored.document).await?;
        Ok((stored.document.id, stored.document.version))
    }

    /// Load one revision. Documents chunked by an older tokenizer are
    /// rechunked in memory.
    pub async fn load_version(&self, document_id: &str, version: u64) -> MemoryResult<Option<StoredDocument>> {
        if let Some(stored) = self.cached(document_id, version) {
            return Ok(Some(stored));
        }
        let Some(bytes) = self.objects.get(&object_key(document_id, version)).await? else {
            return Ok(None);
        };
        let mut stored: StoredDocument = serde_json::from_slice(&bytes).map_err(|e| {
            MemoryError::internal(format!("corrupt object for '{document_id}' v{version}: {e}"))
        })?;

        if stored.document.tokenizer_version != TOKENIZER_VERSION {
            match chunk::build_chunks(document_id, &stored.document.content, self.limits.max_tokens_per_chunk) {
                Ok(chunks) => {
                    debug!(
                        document_id,
                        from = stored.document.tokenizer_version,
                        to = TOKENIZER_VERSION,
                        "Rechunked document for current tokenizer"
                    );
                    stored.document.token_count = chunks.iter().map(|c| c.token_count).sum();
                    stored.document.tokenizer_version = TOKENIZER_VERSION;
                    stored.chunks = chunks;
                    self.rewrite(&stored).await;
                }
                Err(e) => warn!(document_id, error = %e, "Keeping stored chunks; rechunk failed"),
            }
        }
        self.remember(&stored);
        Ok(Some(stored))
    }

    /// Overwrite a rechunked revision in place. Content, version and
    /// metadata are unchanged, so a failure only means the next read
    /// rechunks again.
    async fn rewrite(&self, stored: &StoredDocument) {
        let doc = &stored.document;
        let result = match serde_json::to_vec(stored) {
            Ok(body) => self.objects.put(&object_key(&doc.id, doc.version), body).await,
            Err(e) => Err(MemoryError::internal(format!("encode document: {e}"))),
        };
        if let Err(e) = result {
            warn!(document_id = %doc.id, version = doc.version, error = %e, "Failed to re-persist rechunked revision");
        }
    }

    /// Latest live revision of a document.
    pub async fn get(&self, document_id: &str) -> MemoryResult<StoredDocument> {
        let latest = self
            .latest_version(document_id)
            .await?
            .ok_or_else(|| MemoryError::not_found(document_id))?;
        let stored = self
            .load_version(document_id, latest)
            .await?
            .ok_or_else(|| MemoryError::not_found(document_id))?;
        if stored.document.is_deleted {
            return Err(MemoryError::not_found(document_id));
        }
        Ok(stored)
    }

    /// The tombstone revision that soft-deletes `document_id`. Its version
    /// is `base_version`, so it goes through the normal put protocol.
    ///
    /// If the tombstone at `base_version + 1` was already written, it is
    /// returned again so a replayed delete persists as an idempotent replay.
    pub async fn tombstone(&self, document_id: &str, base_version: u64) -> MemoryResult<Document> {
        let latest = self
            .latest_version(document_id)
            .await?
            .ok_or_else(|| MemoryError::not_found(document_id))?;
        let current = self
            .load_version(document_id, latest)
            .await?
            .ok_or_else(|| MemoryError::not_found(document_id))?;
        if current.document.is_deleted && latest != base_version.saturating_add(1) {
            return Err(MemoryError::not_found(document_id));
        }
        let mut doc = current.document;
        doc.is_deleted = true;
        doc.version = base_version;
        Ok(doc)
    }

    /// Documents matching `filter`, at the versions the index records.
    pub async fn candidates(&self, filter: &MetadataFilter, limit: usize) -> MemoryResult<CandidateSet> {
        let entries = self.index.query(filter, limit).await?;
        let mut docs = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.load_version(&entry.document_id, entry.version).await? {
                Some(stored) if !stored.document.is_deleted => docs.push(stored),
                Some(_) => debug!(document_id = %entry.document_id, "Skipping deleted document"),
                None => warn!(
                    document_id = %entry.document_id,
                    version = entry.version,
                    "Index entry points at a missing revision"
                ),
            }
        }
        Ok(CandidateSet::new(docs))
    }

    pub async fn record_access(&self, document_id: &str) -> MemoryResult<()> {
        self.index.record_access(document_id, Utc::now()).await
    }

    pub async fn index_entry(&self, document_id: &str) -> MemoryResult<Option<IndexEntry>> {
        self.index.get(document_id).await
    }

    /// Physically delete every revision and the index entry. Returns the
    /// number of objects removed.
    pub async fn purge(&self, document_id: &str) -> MemoryResult<usize> {
        let keys = self.objects.list(&document_prefix(document_id)).await?;
        for key in &keys {
            self.objects.delete(key).await?;
            if let Some((_, version)) = parse_object_key(key) {
                self.forget(document_id, version);
            }
        }
        self.index.remove(document_id).await?;
        info!(document_id, objects = keys.len(), "Purged document");
        Ok(keys.len())
    }

    /// Repair the index from the object store.
    ///
    /// Upserts entries that are missing or older than the latest revision,
    /// removes entries for deleted or purged documents. Per-document
    /// failures are collected in the report; a failure to list the object
    /// store fails the pass.
    pub async fn reconcile(&self) -> MemoryResult<ReconcileReport> {
        let keys = self.objects.list(DOCUMENTS_PREFIX).await.map_err(|e| {
            MemoryError::Reconciliation {
                message: format!("listing object store: {e}"),
            }
        })?;
        let mut latest: BTreeMap<String, u64> = BTreeMap::new();
        for key in &keys {
            if let Some((id, version)) = parse_object_key(key) {
                let slot = latest.entry(id.to_string()).or_insert(version);
                *slot = (*slot).max(version);
            }
        }

        let mut report = ReconcileReport {
            scanned: latest.len(),
            ..ReconcileReport::default()
        };

        for (id, version) in &latest {
            if let Err(e) = self.reconcile_one(id, *version, &mut report).await {
                let err = MemoryError::Reconciliation {
                    message: format!("{id}: {e}"),
                };
                warn!(document_id = %id, error = %err, "Reconciliation failed; will retry next cycle");
                report.errors.push(err.to_string());
            }
        }

        let indexed = self.index.list().await.map_err(|e| MemoryError::Reconciliation {
            message: format!("listing index: {e}"),
        })?;
        for entry in indexed {
            if !latest.contains_key(&entry.document_id) {
                self.index.remove(&entry.document_id).await?;
                report.removed.push(entry.document_id);
            }
        }

        info!(
            scanned = report.scanned,
            repaired = report.repaired.len(),
            removed = report.removed.len(),
            errors = report.errors.len(),
            "Reconciliation pass finished"
        );
        Ok(report)
    }

    async fn reconcile_one(&self, id: &str, version: u64, report: &mut ReconcileReport) -> MemoryResult<()> {
        let entry = self.index.get(id).await?;
        if entry.as_ref().is_some_and(|e| e.version >= version) {
            return Ok(());
        }
        let stored = self
            .load_version(id, version)
            .await?
            .ok_or_else(|| MemoryError::internal(format!("revision v{version} vanished")))?;
        if stored.document.is_deleted {
            if entry.is_some() {
                self.index.remove(id).await?;
                report.removed.push(id.to_string());
            }
        } else {
            self.index.upsert(&IndexEntry::from_document(&stored.document)).await?;
            report.repaired.push(id.to_string());
        }
        Ok(())
    }
}
