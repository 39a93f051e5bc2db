//! Retrieval orchestrator: drives store, delete, and retrieve workflows.
//!
//! Every operation is a [`WorkflowExecution`] advanced through the
//! transition tables in [`memory_agent_core::workflow`]. After each
//! transition the execution is written to the in-process arena and to the
//! [`WorkflowJournal`], so [`Orchestrator::resume_incomplete`] can pick up
//! unfinished work after a restart. The arena holds running executions
//! only; a finished one is dropped from it and read back from the journal.
//!
//! # Step handling
//!
//! Each step runs on the [`WorkerPool`] under a timeout. On failure the
//! orchestrator asks [`decide`] what to do and applies the answer:
//!
//! | Decision | Effect |
//! |----------|--------|
//! | `Retry(delay)` | `RetryScheduled` self-transition, sleep, run the step again |
//! | `Fallback(tier)` | keep any partial stage output, `FallbackDispatched`, dispatch the next tier |
//! | `Defer` | index update skipped with a warning; reconciliation repairs it |
//! | `Fail` | workflow moves to `Failed` with a sanitized [`WorkflowFailure`] |
//!
//! A step whose state has no retry loop fails on its first error.
//! Cancellation is cooperative and checked before every step.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use memory_agent_core::aggregate::aggregate;
use memory_agent_core::engine::Capabilities;
use memory_agent_core::models::{
    CandidateSet, Document, RequestedStrategy, RetrievalRequest, ScoredDocument, StoredDocument, Tier,
};
use memory_agent_core::policy::{decide, Decision, RetryPolicy, StepKind};
use memory_agent_core::store::WorkflowJournal;
use memory_agent_core::strategy::{select_strategy, PartialOutput, StrategyQuery, StrategySet};
use memory_agent_core::workflow::{
    Event, RetrieveState, StoreReceipt, StoreState, WorkflowExecution, WorkflowInput, WorkflowKind,
    WorkflowOutput, WorkflowState,
};
use memory_agent_core::{ErrorKind, MemoryError, MemoryResult, WorkflowFailure};

use crate::config::Config;
use crate::coordinator::{PersistOutcome, ReconcileReport, StorageCoordinator};
use crate::worker::{WorkKind, WorkerPool};

/// Orchestrator tuning, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_strategy: RequestedStrategy,
    pub similarity_threshold: f64,
    /// Upper bound on the candidate set fetched from the index.
    pub max_candidates: usize,
    /// Timeout for one storage call.
    pub storage_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_strategy: RequestedStrategy::Auto,
            similarity_threshold: 0.7,
            max_candidates: 500,
            storage_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_strategy: config.retrieval.default_strategy,
            similarity_threshold: config.retrieval.similarity_threshold,
            max_candidates: config.retrieval.max_candidates,
            storage_timeout: config.timeouts.storage(),
            retry: config.retry.policy(),
        }
    }
}

/// Error returned by orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The operation was rejected or failed outside a workflow.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// A workflow reached its failed state.
    #[error("workflow {id} failed: {failure}")]
    Workflow { id: Uuid, failure: WorkflowFailure },
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Memory(e) => e.kind(),
            OrchestratorError::Workflow { failure, .. } => failure.kind,
        }
    }

    /// Caller-safe description.
    pub fn message(&self) -> String {
        match self {
            OrchestratorError::Memory(e) => e.sanitized_message(),
            OrchestratorError::Workflow { failure, .. } => failure.message.clone(),
        }
    }

    /// The step that failed, for workflow failures.
    pub fn step(&self) -> Option<&str> {
        match self {
            OrchestratorError::Memory(_) => None,
            OrchestratorError::Workflow { failure, .. } => Some(&failure.step),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Outcome of [`Orchestrator::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `"ok"` when both stores answer, `"degraded"` otherwise.
    pub status: &'static str,
    pub version: &'static str,
    pub object_store: bool,
    pub index: bool,
    pub capabilities: Capabilities,
    pub running_workflows: usize,
    pub available_workers: BTreeMap<&'static str, usize>,
}

/// Result of [`Orchestrator::resume_incomplete`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResumeReport {
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

/// Why a workflow driver stopped before reaching a terminal state.
enum Halt {
    Failed { step: String, error: MemoryError },
    Cancelled { step: String },
}

impl Halt {
    fn failed(step: impl ToString, error: MemoryError) -> Self {
        Halt::Failed {
            step: step.to_string(),
            error,
        }
    }
}

enum StepOutcome<T> {
    Done(T),
    /// The policy deferred the step; the workflow continues without it.
    Deferred(MemoryError),
}

impl<T> StepOutcome<T> {
    fn required(self, step: StepKind) -> Result<T, Halt> {
        match self {
            StepOutcome::Done(value) => Ok(value),
            StepOutcome::Deferred(error) => Err(Halt::failed(step, error)),
        }
    }
}

/// Owns the workflow arena and drives workflows to completion.
///
/// Cheap to clone; clones share the arena, stores, and worker pool.
#[derive(Clone)]
pub struct Orchestrator {
    coordinator: Arc<StorageCoordinator>,
    strategies: StrategySet,
    pool: WorkerPool,
    journal: Arc<dyn WorkflowJournal>,
    settings: Arc<OrchestratorSettings>,
    arena: Arc<RwLock<HashMap<Uuid, WorkflowExecution>>>,
}

impl Orchestrator {
    pub fn new(
        coordinator: Arc<StorageCoordinator>,
        strategies: StrategySet,
        pool: WorkerPool,
        journal: Arc<dyn WorkflowJournal>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            coordinator,
            strategies,
            pool,
            journal,
            settings: Arc::new(settings),
            arena: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn coordinator(&self) -> &StorageCoordinator {
        &self.coordinator
    }

    // ============ Public operations ============

    /// Store a document. `document.version` is the caller's base version
    /// (0 for a new document).
    pub async fn store_document(&self, document: Document) -> OrchestratorResult<StoreReceipt> {
        let exec = self.execute(WorkflowExecution::new_store(document)).await?;
        receipt(&exec)
    }

    /// Soft-delete a document whose current version is `base_version`.
    pub async fn delete_document(&self, document_id: &str, base_version: u64) -> OrchestratorResult<StoreReceipt> {
        let exec = self
            .execute(WorkflowExecution::new_delete(document_id, base_version))
            .await?;
        receipt(&exec)
    }

    /// Latest live revision of a document.
    pub async fn retrieve_document(&self, document_id: &str) -> OrchestratorResult<Document> {
        let stored = self
            .retrying(StepKind::Get, WorkKind::ObjectStore, || {
                self.coordinator.get(document_id)
            })
            .await?;
        self.touch(document_id).await;
        Ok(stored.document)
    }

    /// Run a retrieve workflow and return the ranked documents.
    pub async fn search_documents(&self, request: RetrievalRequest) -> OrchestratorResult<Vec<ScoredDocument>> {
        validate_request(&request)?;
        let exec = self.execute(WorkflowExecution::new_retrieve(request)).await?;
        self.scored_documents(&exec).await
    }

    /// Start a retrieve workflow in the background.
    pub fn spawn_search(
        &self,
        request: RetrievalRequest,
    ) -> OrchestratorResult<(Uuid, JoinHandle<OrchestratorResult<Vec<ScoredDocument>>>)> {
        validate_request(&request)?;
        let exec = WorkflowExecution::new_retrieve(request);
        let id = self.register(&exec);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let exec = this.execute(exec).await?;
            this.scored_documents(&exec).await
        });
        Ok((id, handle))
    }

    /// Start a store workflow in the background.
    pub fn spawn_store(&self, document: Document) -> (Uuid, JoinHandle<OrchestratorResult<StoreReceipt>>) {
        let exec = WorkflowExecution::new_store(document);
        let id = self.register(&exec);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let exec = this.execute(exec).await?;
            receipt(&exec)
        });
        (id, handle)
    }

    /// Request cooperative cancellation. Returns the execution as it stands,
    /// or `None` for an unknown id.
    ///
    /// A running execution sees the flag before its next step and journals
    /// the cancellation itself. One known only to the journal is flagged
    /// there, so a later resume stops it.
    pub async fn cancel(&self, id: Uuid) -> MemoryResult<Option<WorkflowExecution>> {
        let running = {
            let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
            arena.get_mut(&id).map(|exec| {
                if !exec.is_finished() {
                    exec.cancel_requested = true;
                }
                exec.clone()
            })
        };
        if let Some(exec) = running {
            info!(workflow_id = %id, state = %exec.state, "Cancellation requested");
            return Ok(Some(exec));
        }
        let Some(mut exec) = self.journal.load(id).await? else {
            return Ok(None);
        };
        if !exec.is_finished() {
            exec.cancel_requested = true;
            info!(workflow_id = %id, state = %exec.state, "Cancellation requested");
            self.journal.save(&exec).await?;
        }
        Ok(Some(exec))
    }

    /// Look up an execution in this process or in the journal.
    pub async fn execution(&self, id: Uuid) -> MemoryResult<Option<WorkflowExecution>> {
        let local = {
            let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
            arena.get(&id).cloned()
        };
        match local {
            Some(exec) => Ok(Some(exec)),
            None => self.journal.load(id).await,
        }
    }

    /// Drive every journaled execution that has not finished, oldest first.
    /// Executions already running in this process are skipped.
    pub async fn resume_incomplete(&self) -> MemoryResult<ResumeReport> {
        let pending = self.journal.list_unfinished().await?;
        let mut report = ResumeReport::default();
        for exec in pending {
            let running = {
                let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
                arena.contains_key(&exec.id)
            };
            if running {
                continue;
            }
            let id = exec.id;
            info!(workflow_id = %id, kind = %exec.kind, state = %exec.state, "Resuming workflow");
            match self.execute(exec).await {
                Ok(_) => report.completed.push(id),
                Err(_) => report.failed.push(id),
            }
        }
        Ok(report)
    }

    pub async fn health_check(&self) -> HealthReport {
        let check_id = "health-check";
        let object_store = self
            .pool
            .run(
                WorkKind::ObjectStore,
                self.settings.storage_timeout,
                self.coordinator.latest_version(check_id),
            )
            .await
            .is_ok();
        let index = self
            .pool
            .run(
                WorkKind::Index,
                self.settings.storage_timeout,
                self.coordinator.index_entry(check_id),
            )
            .await
            .is_ok();
        let running_workflows = {
            let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
            arena.values().filter(|e| !e.is_finished()).count()
        };
        let available_workers = [
            WorkKind::Reasoning,
            WorkKind::Embedding,
            WorkKind::Graph,
            WorkKind::ObjectStore,
            WorkKind::Index,
            WorkKind::Chunking,
        ]
        .into_iter()
        .map(|kind| (kind.as_str(), self.pool.available(kind)))
        .collect();

        HealthReport {
            status: if object_store && index { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            object_store,
            index,
            capabilities: self.strategies.capabilities(),
            running_workflows,
            available_workers,
        }
    }

    /// One reconciliation pass over the object store and index.
    pub async fn reconcile(&self) -> MemoryResult<ReconcileReport> {
        self.pool
            .run(
                WorkKind::Index,
                self.settings.storage_timeout * 10,
                self.coordinator.reconcile(),
            )
            .await
    }

    /// Run [`reconcile`](Self::reconcile) every `interval` until the task is aborted.
    pub fn spawn_reconciler(&self, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = this.reconcile().await {
                    match decide(StepKind::Reconcile, &e, 1, &this.settings.retry) {
                        Decision::Retry(delay) => {
                            warn!(error = %e, delay_ms = delay.as_millis() as u64, "Reconciliation failed; retrying");
                            tokio::time::sleep(delay).await;
                            if let Err(e) = this.reconcile().await {
                                warn!(error = %e, "Reconciliation failed; will retry next cycle");
                            }
                        }
                        _ => warn!(error = %e, "Reconciliation failed; will retry next cycle"),
                    }
                }
            }
        })
    }

    /// Physically remove every revision of a document.
    pub async fn purge_document(&self, document_id: &str) -> OrchestratorResult<usize> {
        Ok(self
            .retrying(StepKind::Persist, WorkKind::ObjectStore, || {
                self.coordinator.purge(document_id)
            })
            .await?)
    }

    // ============ Arena and journal ============

    fn register(&self, exec: &WorkflowExecution) -> Uuid {
        let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
        arena.insert(exec.id, exec.clone());
        exec.id
    }

    /// Drop a finished execution from the arena. The journal keeps it.
    fn release(&self, id: Uuid) {
        let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
        arena.remove(&id);
    }

    /// Publish `exec` to the arena and the journal. A cancellation flag set
    /// in the arena since the last checkpoint is carried over.
    async fn checkpoint(&self, exec: &mut WorkflowExecution) {
        {
            let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = arena.get(&exec.id) {
                exec.cancel_requested |= existing.cancel_requested;
            }
            arena.insert(exec.id, exec.clone());
        }
        if let Err(e) = self.journal.save(exec).await {
            warn!(workflow_id = %exec.id, state = %exec.state, error = %e, "Failed to journal workflow");
        }
    }

    async fn transition(&self, exec: &mut WorkflowExecution, event: Event, note: Option<String>) -> Result<(), Halt> {
        let from = exec.state;
        exec.advance(event, note)
            .map_err(|e| Halt::failed(from, e))?;
        debug!(workflow_id = %exec.id, from = %from, to = %exec.state, ?event, "Workflow transition");
        self.checkpoint(exec).await;
        Ok(())
    }

    fn check_cancel(&self, exec: &mut WorkflowExecution) -> Result<(), Halt> {
        let flagged = {
            let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
            arena.get(&exec.id).is_some_and(|e| e.cancel_requested)
        };
        if exec.cancel_requested || flagged {
            exec.cancel_requested = true;
            return Err(Halt::Cancelled {
                step: exec.state.to_string(),
            });
        }
        Ok(())
    }

    // ============ Drivers ============

    /// Drive `exec` to a terminal state and report the outcome.
    async fn execute(&self, mut exec: WorkflowExecution) -> OrchestratorResult<WorkflowExecution> {
        self.checkpoint(&mut exec).await;
        debug!(workflow_id = %exec.id, kind = %exec.kind, state = %exec.state, "Workflow started");

        let result = match exec.kind {
            WorkflowKind::Retrieve => self.drive_retrieve(&mut exec).await,
            WorkflowKind::Store | WorkflowKind::Delete => self.drive_store(&mut exec).await,
        };

        let failure = match result {
            Ok(()) => {
                info!(
                    workflow_id = %exec.id,
                    kind = %exec.kind,
                    attempted_tiers = ?exec.attempted_tiers,
                    warnings = exec.warnings.len(),
                    "Workflow completed"
                );
                self.release(exec.id);
                return Ok(exec);
            }
            Err(Halt::Failed { step, error: err }) => {
                error!(workflow_id = %exec.id, kind = %exec.kind, step = %step, error = %err, "Workflow failed");
                WorkflowFailure::from_error(step, &err)
            }
            Err(Halt::Cancelled { step }) => {
                info!(workflow_id = %exec.id, kind = %exec.kind, step = %step, "Workflow cancelled");
                WorkflowFailure::cancelled(step)
            }
        };

        if let Err(e) = exec.fail(failure.clone()) {
            error!(workflow_id = %exec.id, error = %e, "Could not record workflow failure");
        }
        self.checkpoint(&mut exec).await;
        self.release(exec.id);
        Err(OrchestratorError::Workflow { id: exec.id, failure })
    }

    /// Run a storage step with retries recorded on `exec`.
    async fn run_step<T, F, Fut>(
        &self,
        exec: &mut WorkflowExecution,
        step: StepKind,
        work: WorkKind,
        mut op: F,
    ) -> Result<StepOutcome<T>, Halt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MemoryResult<T>>,
    {
        loop {
            self.check_cancel(exec)?;
            let attempt = exec.record_attempt(step);
            let err = match self.pool.run(work, self.settings.storage_timeout, op()).await {
                Ok(value) => return Ok(StepOutcome::Done(value)),
                Err(e) => e,
            };
            let mut decision = decide(step, &err, attempt, &self.settings.retry);
            if matches!(decision, Decision::Retry(_)) && exec.state.next(Event::RetryScheduled).is_none() {
                decision = Decision::Fail;
            }
            match decision {
                Decision::Retry(delay) => {
                    warn!(
                        workflow_id = %exec.id,
                        step = %step,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Step failed; retrying"
                    );
                    let note = format!("{step} attempt {attempt} failed: {}", err.kind());
                    self.transition(exec, Event::RetryScheduled, Some(note)).await?;
                    tokio::time::sleep(delay).await;
                }
                Decision::Defer => return Ok(StepOutcome::Deferred(err)),
                Decision::Fallback(_) | Decision::Fail => return Err(Halt::failed(step, err)),
            }
        }
    }

    /// Run a step outside any workflow, retrying per policy.
    async fn retrying<T, F, Fut>(&self, step: StepKind, work: WorkKind, mut op: F) -> MemoryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MemoryResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.pool.run(work, self.settings.storage_timeout, op()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match decide(step, &err, attempt, &self.settings.retry) {
                Decision::Retry(delay) => {
                    debug!(step = %step, attempt, error = %err, "Retrying");
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(err),
            }
        }
    }

    async fn drive_store(&self, exec: &mut WorkflowExecution) -> Result<(), Halt> {
        let mut revision: Option<Document> = None;
        let mut prepared: Option<StoredDocument> = None;

        while !exec.is_finished() {
            self.check_cancel(exec)?;
            let WorkflowState::Store(state) = exec.state else {
                return Err(Halt::failed(
                    exec.state,
                    MemoryError::internal("store driver given a retrieve workflow"),
                ));
            };
            match state {
                StoreState::Received => {
                    let doc = self.revision(exec, &mut revision).await?;
                    self.coordinator
                        .validate(&doc)
                        .map_err(|e| Halt::failed(StepKind::Validate, e))?;
                    self.transition(exec, Event::Validated, None).await?;
                }
                StoreState::Validated => {
                    let doc = self.revision(exec, &mut revision).await?;
                    let stored = self
                        .chunk(doc)
                        .await
                        .map_err(|e| Halt::failed(StepKind::Chunk, e))?;
                    let note = format!("{} chunks, {} tokens", stored.chunks.len(), stored.document.token_count);
                    prepared = Some(stored);
                    self.transition(exec, Event::Chunked, Some(note)).await?;
                }
                StoreState::Chunked => {
                    let stored = match prepared.take() {
                        Some(stored) => stored,
                        None => {
                            let doc = self.revision(exec, &mut revision).await?;
                            self.chunk(doc)
                                .await
                                .map_err(|e| Halt::failed(StepKind::Chunk, e))?
                        }
                    };
                    let outcome = self
                        .run_step(exec, StepKind::Persist, WorkKind::ObjectStore, || {
                            self.coordinator.persist(&stored)
                        })
                        .await?
                        .required(StepKind::Persist)?;
                    let note = match &outcome {
                        PersistOutcome::Written(s) => format!("wrote v{}", s.document.version),
                        PersistOutcome::Replayed(s) => format!("replayed v{}", s.document.version),
                    };
                    let stored = outcome.into_stored();
                    exec.output = Some(WorkflowOutput::Stored(StoreReceipt {
                        document_id: stored.document.id.clone(),
                        version: stored.document.version,
                        chunk_count: stored.chunks.len(),
                        warnings: Vec::new(),
                    }));
                    prepared = Some(stored);
                    self.transition(exec, Event::Persisted, Some(note)).await?;
                }
                StoreState::Persisted => {
                    let doc = match prepared.take() {
                        Some(stored) => stored.document,
                        None => self.persisted_revision(exec).await?,
                    };
                    let outcome = self
                        .run_step(exec, StepKind::Index, WorkKind::Index, || {
                            self.coordinator.update_index(&doc)
                        })
                        .await?;
                    match outcome {
                        StepOutcome::Done(()) => self.transition(exec, Event::Indexed, None).await?,
                        StepOutcome::Deferred(err) => {
                            warn!(
                                workflow_id = %exec.id,
                                document_id = %doc.id,
                                error = %err,
                                "Index update deferred to reconciliation"
                            );
                            let warning = format!("index update deferred: {}", err.sanitized_message());
                            exec.warnings.push(warning.clone());
                            if let Some(WorkflowOutput::Stored(receipt)) = exec.output.as_mut() {
                                receipt.warnings.push(warning.clone());
                            }
                            self.transition(exec, Event::IndexDeferred, Some(warning)).await?;
                        }
                    }
                }
                StoreState::Indexed => self.transition(exec, Event::Finished, None).await?,
                StoreState::Completed | StoreState::Failed => break,
            }
        }
        Ok(())
    }

    /// The revision a store or delete workflow writes, with the base
    /// version in `version`.
    async fn revision(&self, exec: &WorkflowExecution, cache: &mut Option<Document>) -> Result<Document, Halt> {
        if let Some(doc) = cache {
            return Ok(doc.clone());
        }
        let doc = match &exec.input {
            WorkflowInput::Store { document } => document.clone(),
            WorkflowInput::Delete {
                document_id,
                base_version,
            } => self
                .pool
                .run(
                    WorkKind::ObjectStore,
                    self.settings.storage_timeout,
                    self.coordinator.tombstone(document_id, *base_version),
                )
                .await
                .map_err(|e| Halt::failed(StepKind::Get, e))?,
            WorkflowInput::Retrieve { .. } => {
                return Err(Halt::failed(
                    StepKind::Validate,
                    MemoryError::internal("retrieve input in a store workflow"),
                ))
            }
        };
        *cache = Some(doc.clone());
        Ok(doc)
    }

    /// Reload the revision a resumed workflow already persisted.
    async fn persisted_revision(&self, exec: &mut WorkflowExecution) -> Result<Document, Halt> {
        let Some(WorkflowOutput::Stored(receipt)) = &exec.output else {
            return Err(Halt::failed(
                StepKind::Index,
                MemoryError::internal("persisted workflow has no receipt"),
            ));
        };
        let (id, version) = (receipt.document_id.clone(), receipt.version);
        self.run_step(exec, StepKind::Index, WorkKind::ObjectStore, || {
            self.coordinator.load_version(&id, version)
        })
        .await?
        .required(StepKind::Index)?
        .map(|stored| stored.document)
        .ok_or_else(|| {
            Halt::failed(
                StepKind::Index,
                MemoryError::internal(format!("revision v{version} of '{id}' is missing")),
            )
        })
    }

    async fn chunk(&self, doc: Document) -> MemoryResult<StoredDocument> {
        let coordinator = self.coordinator.clone();
        self.pool
            .run(WorkKind::Chunking, self.settings.storage_timeout, async move {
                tokio::task::spawn_blocking(move || coordinator.prepare(doc))
                    .await
                    .map_err(|e| MemoryError::internal(format!("chunking task failed: {e}")))?
            })
            .await
    }

    async fn drive_retrieve(&self, exec: &mut WorkflowExecution) -> Result<(), Halt> {
        let request = exec.request().cloned().ok_or_else(|| {
            Halt::failed(
                StepKind::FetchCandidates,
                MemoryError::internal("retrieve driver given a store workflow"),
            )
        })?;
        let query = StrategyQuery {
            text: request.query.clone(),
            similarity_threshold: request
                .similarity_threshold
                .unwrap_or(self.settings.similarity_threshold),
            limit: request.limit,
        };
        let mut candidates: Option<CandidateSet> = None;

        while !exec.is_finished() {
            self.check_cancel(exec)?;
            let WorkflowState::Retrieve(state) = exec.state else {
                return Err(Halt::failed(
                    exec.state,
                    MemoryError::internal("retrieve driver given a store workflow"),
                ));
            };
            match state {
                RetrieveState::Received => {
                    let set = self.fetch_candidates(exec, &request).await?;
                    let tier = select_strategy(
                        request.strategy,
                        self.settings.default_strategy,
                        self.strategies.capabilities(),
                    );
                    exec.candidate_ids = set.ids();
                    exec.current_tier = Some(tier);
                    let note = format!("{} candidates", set.len());
                    candidates = Some(set);
                    self.transition(exec, Event::CandidatesFetched, Some(note)).await?;
                }
                RetrieveState::CandidatesFetched => {
                    let tier = self.current_tier(exec)?;
                    exec.attempted_tiers.push(tier);
                    info!(workflow_id = %exec.id, tier = %tier, "Dispatching strategy");
                    self.transition(exec, Event::StrategyDispatched, Some(tier.to_string()))
                        .await?;
                }
                RetrieveState::StrategyDispatched | RetrieveState::FallbackDispatched => {
                    let set = match candidates.take() {
                        Some(set) => set,
                        None => self.restore_candidates(exec, &request).await?,
                    };
                    let dispatched = self.dispatch(exec, &query, &set).await;
                    candidates = Some(set);
                    dispatched?;
                }
                RetrieveState::Aggregating => {
                    let set = match candidates.take() {
                        Some(set) => set,
                        None => self.restore_candidates(exec, &request).await?,
                    };
                    let hits = aggregate(&exec.partial_results, &set, request.limit);
                    let note = format!("{} hits", hits.len());
                    exec.output = Some(WorkflowOutput::Retrieved { hits });
                    candidates = Some(set);
                    self.transition(exec, Event::Aggregated, Some(note)).await?;
                }
                RetrieveState::Completed | RetrieveState::Failed => break,
            }
        }
        Ok(())
    }

    fn current_tier(&self, exec: &WorkflowExecution) -> Result<Tier, Halt> {
        exec.current_tier.ok_or_else(|| {
            Halt::failed(
                exec.state,
                MemoryError::internal("retrieve workflow has no current tier"),
            )
        })
    }

    async fn fetch_candidates(&self, exec: &mut WorkflowExecution, request: &RetrievalRequest) -> Result<CandidateSet, Halt> {
        let max = self.settings.max_candidates;
        self.run_step(exec, StepKind::FetchCandidates, WorkKind::Index, || {
            self.coordinator.candidates(&request.filter, max)
        })
        .await?
        .required(StepKind::FetchCandidates)
    }

    /// Rebuild the candidate set of a resumed workflow, limited to the ids
    /// recorded when it was first fetched.
    async fn restore_candidates(
        &self,
        exec: &mut WorkflowExecution,
        request: &RetrievalRequest,
    ) -> Result<CandidateSet, Halt> {
        let fresh = self.fetch_candidates(exec, request).await?;
        let kept = fresh
            .select(&exec.candidate_ids)
            .into_iter()
            .cloned()
            .collect();
        Ok(CandidateSet::new(kept))
    }

    /// One attempt of the current tier, followed by the policy decision.
    async fn dispatch(&self, exec: &mut WorkflowExecution, query: &StrategyQuery, candidates: &CandidateSet) -> Result<(), Halt> {
        let tier = self.current_tier(exec)?;
        let step = StepKind::Strategy(tier);
        let attempt = exec.record_attempt(step);
        let executor = self.strategies.get(tier);
        let partial = PartialOutput::default();

        let err = match self
            .pool
            .run_strategy(executor.as_ref(), query, candidates, &partial)
            .await
        {
            Ok(result) => {
                info!(
                    workflow_id = %exec.id,
                    tier = %tier,
                    attempt,
                    hits = result.hits.len(),
                    "Strategy succeeded"
                );
                exec.partial_results.push(result);
                return self
                    .transition(exec, Event::StrategySucceeded, Some(tier.to_string()))
                    .await;
            }
            Err(e) => e,
        };

        match decide(step, &err, attempt, &self.settings.retry) {
            Decision::Retry(delay) => {
                warn!(
                    workflow_id = %exec.id,
                    step = %step,
                    tier = %tier,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Strategy failed; retrying"
                );
                let note = format!("{tier} attempt {attempt} failed: {}", err.kind());
                self.transition(exec, Event::RetryScheduled, Some(note)).await?;
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Decision::Fallback(next) => {
                warn!(
                    workflow_id = %exec.id,
                    step = %step,
                    tier = %tier,
                    next = %next,
                    attempt,
                    error = %err,
                    "Strategy exhausted; falling back"
                );
                exec.warnings
                    .push(format!("{tier} failed ({}); fell back to {next}", err.kind()));
                if let Some(stage) = partial.take() {
                    debug!(
                        workflow_id = %exec.id,
                        tier = %tier,
                        stage = %stage.strategy,
                        hits = stage.hits.len(),
                        "Keeping partial output of failed strategy"
                    );
                    exec.partial_results.push(stage);
                }
                exec.current_tier = Some(next);
                exec.attempted_tiers.push(next);
                self.transition(exec, Event::FallbackDispatched, Some(next.to_string()))
                    .await
            }
            Decision::Defer | Decision::Fail => Err(Halt::failed(step, err)),
        }
    }

    /// Resolve a completed retrieve workflow's hits to documents.
    async fn scored_documents(&self, exec: &WorkflowExecution) -> OrchestratorResult<Vec<ScoredDocument>> {
        let hits = match &exec.output {
            Some(WorkflowOutput::Retrieved { hits }) => hits,
            _ => {
                return Err(MemoryError::internal(format!("workflow {} has no retrieval output", exec.id)).into())
            }
        };
        let mut docs = Vec::with_capacity(hits.len());
        for hit in hits {
            let fetched = self
                .retrying(StepKind::Get, WorkKind::ObjectStore, || {
                    self.coordinator.get(&hit.document_id)
                })
                .await;
            match fetched {
                Ok(stored) => {
                    self.touch(&hit.document_id).await;
                    docs.push(ScoredDocument {
                        document: stored.document,
                        score: hit.score,
                        strategy: hit.strategy,
                    });
                }
                Err(MemoryError::NotFound { .. }) => {
                    debug!(workflow_id = %exec.id, document_id = %hit.document_id, "Hit deleted since retrieval");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(docs)
    }

    /// Record an access; failures only cost statistics.
    async fn touch(&self, document_id: &str) {
        let result = self
            .pool
            .run(
                WorkKind::Index,
                self.settings.storage_timeout,
                self.coordinator.record_access(document_id),
            )
            .await;
        if let Err(e) = result {
            debug!(document_id, error = %e, "Failed to record access");
        }
    }
}

fn validate_request(request: &RetrievalRequest) -> MemoryResult<()> {
    if request.query.trim().is_empty() {
        return Err(MemoryError::validation("query must not be empty"));
    }
    if request.limit == 0 {
        return Err(MemoryError::validation("limit must be at least 1"));
    }
    if let Some(threshold) = request.similarity_threshold {
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(MemoryError::validation(
                "similarity_threshold must be between -1 and 1",
            ));
        }
    }
    Ok(())
}

fn receipt(exec: &WorkflowExecution) -> OrchestratorResult<StoreReceipt> {
    match &exec.output {
        Some(WorkflowOutput::Stored(receipt)) => Ok(receipt.clone()),
        _ => Err(MemoryError::internal(format!("workflow {} has no store receipt", exec.id)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        assert!(validate_request(&RetrievalRequest::new("deploy")).is_ok());
        assert!(validate_request(&RetrievalRequest::new("   ")).is_err());

        let mut request = RetrievalRequest::new("deploy");
        request.limit = 0;
        assert!(validate_request(&request).is_err());

        let mut request = RetrievalRequest::new("deploy");
        request.similarity_threshold = Some(1.5);
        assert!(validate_request(&request).is_err());
    }

    #[test]
    fn test_error_accessors() {
        let err = OrchestratorError::Workflow {
            id: Uuid::new_v4(),
            failure: WorkflowFailure::cancelled("chunked"),
        };
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.step(), Some("chunked"));

        let err = OrchestratorError::from(MemoryError::internal("disk on fire"));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.message(), "internal error");
        assert_eq!(err.step(), None);
    }
}
