//! End-to-end workflow tests against in-memory stores and in-process
//! engine fakes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use memory_agent::config::WorkersConfig;
use memory_agent::coordinator::{StorageCoordinator, StorageLimits};
use memory_agent::orchestrator::{Orchestrator, OrchestratorError, OrchestratorSettings};
use memory_agent::worker::WorkerPool;
use memory_agent_core::embedding::{Embedding, EmbeddingEngine};
use memory_agent_core::engine::{
    GraphEdge, GraphService, ReasoningEngine, ReasoningRequest, ReasoningResponse, Selection,
};
use memory_agent_core::filter::MetadataFilter;
use memory_agent_core::models::{
    Document, DocumentFormat, IndexEntry, Metadata, RequestedStrategy, RetrievalRequest, Tier,
};
use memory_agent_core::policy::RetryPolicy;
use memory_agent_core::store::memory::{
    InMemoryEmbeddingCache, InMemoryIndexStore, InMemoryJournal, InMemoryObjectStore,
};
use memory_agent_core::store::{IndexStore, ObjectStore, WorkflowJournal};
use memory_agent_core::strategy::{Engines, LatencyBudgets, StrategySettings, StrategySet};
use memory_agent_core::workflow::{
    Event, RetrieveState, StoreState, WorkflowExecution, WorkflowOutput, WorkflowState,
};
use memory_agent_core::{ErrorKind, MemoryError, MemoryResult};

// ============ Fakes ============

/// Bag-of-words embedder over a fixed vocabulary.
struct KeywordEmbedder {
    vocabulary: Vec<&'static str>,
}

#[async_trait]
impl EmbeddingEngine for KeywordEmbedder {
    fn model_version(&self) -> &str {
        "keywords-v1"
    }

    async fn embed(&self, text: &str) -> MemoryResult<Embedding> {
        let lower = text.to_lowercase();
        let vector = self
            .vocabulary
            .iter()
            .map(|word| lower.matches(word).count() as f32)
            .collect();
        Ok(Embedding {
            vector,
            model_version: self.model_version().to_string(),
        })
    }
}

/// Selects every candidate in presentation order after `delay`.
struct SlowReasoner {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowReasoner {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

/// Decrements the in-flight count even when the call is dropped on timeout.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReasoningEngine for SlowReasoner {
    async fn reason(&self, request: &ReasoningRequest) -> MemoryResult<ReasoningResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(ReasoningResponse {
            selections: request
                .candidates
                .iter()
                .map(|c| Selection {
                    document_id: c.document_id.clone(),
                    confidence: Some(0.9),
                })
                .collect(),
            rationale: None,
        })
    }
}

/// Connects seed entities to fixed weighted documents.
struct FixedGraph {
    edges: HashMap<String, Vec<GraphEdge>>,
}

impl FixedGraph {
    fn new(seed: &str, documents: &[(&str, f64)]) -> Self {
        let edges = documents
            .iter()
            .map(|(id, weight)| GraphEdge {
                document_id: id.to_string(),
                weight: *weight,
            })
            .collect();
        Self {
            edges: HashMap::from([(seed.to_string(), edges)]),
        }
    }
}

#[async_trait]
impl GraphService for FixedGraph {
    async fn connected(&self, seeds: &[String], _max_depth: u32) -> MemoryResult<Vec<GraphEdge>> {
        Ok(seeds
            .iter()
            .filter_map(|s| self.edges.get(s))
            .flatten()
            .cloned()
            .collect())
    }
}

/// Journal that records but never returns a saved execution by id.
struct WriteOnlyJournal {
    inner: InMemoryJournal,
}

#[async_trait]
impl WorkflowJournal for WriteOnlyJournal {
    async fn save(&self, execution: &WorkflowExecution) -> MemoryResult<()> {
        self.inner.save(execution).await
    }

    async fn load(&self, _id: Uuid) -> MemoryResult<Option<WorkflowExecution>> {
        Ok(None)
    }

    async fn list_unfinished(&self) -> MemoryResult<Vec<WorkflowExecution>> {
        self.inner.list_unfinished().await
    }
}

/// Index whose writes fail while `failing` is set.
struct FlakyIndex {
    inner: InMemoryIndexStore,
    failing: AtomicBool,
}

#[async_trait]
impl IndexStore for FlakyIndex {
    async fn upsert(&self, entry: &IndexEntry) -> MemoryResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MemoryError::transient("index unavailable"));
        }
        self.inner.upsert(entry).await
    }

    async fn get(&self, document_id: &str) -> MemoryResult<Option<IndexEntry>> {
        self.inner.get(document_id).await
    }

    async fn remove(&self, document_id: &str) -> MemoryResult<()> {
        self.inner.remove(document_id).await
    }

    async fn query(&self, filter: &MetadataFilter, limit: usize) -> MemoryResult<Vec<IndexEntry>> {
        self.inner.query(filter, limit).await
    }

    async fn record_access(&self, document_id: &str, at: DateTime<Utc>) -> MemoryResult<()> {
        self.inner.record_access(document_id, at).await
    }

    async fn list(&self) -> MemoryResult<Vec<IndexEntry>> {
        self.inner.list().await
    }
}

// ============ Harness ============

struct Harness {
    objects: Arc<InMemoryObjectStore>,
    index: Arc<dyn IndexStore>,
    journal: Arc<dyn WorkflowJournal>,
    reasoning: Option<Arc<dyn ReasoningEngine>>,
    embedding: Option<Arc<dyn EmbeddingEngine>>,
    graph: Option<Arc<dyn GraphService>>,
    strategy: StrategySettings,
    workers: WorkersConfig,
    max_tokens_per_chunk: usize,
}

impl Harness {
    fn new() -> Self {
        Self {
            objects: Arc::new(InMemoryObjectStore::new()),
            index: Arc::new(InMemoryIndexStore::new()),
            journal: Arc::new(InMemoryJournal::new()),
            reasoning: None,
            embedding: None,
            graph: None,
            strategy: StrategySettings::default(),
            workers: WorkersConfig::default(),
            max_tokens_per_chunk: 4000,
        }
    }

    fn with_embedder(mut self) -> Self {
        let embedder: Arc<dyn EmbeddingEngine> = Arc::new(KeywordEmbedder {
            vocabulary: vec!["deploy", "rollback", "garden", "compost"],
        });
        self.embedding = Some(embedder);
        self
    }

    fn with_reasoner(mut self, reasoner: Arc<SlowReasoner>) -> Self {
        let reasoner: Arc<dyn ReasoningEngine> = reasoner;
        self.reasoning = Some(reasoner);
        self
    }

    fn with_graph(mut self, graph: FixedGraph) -> Self {
        let graph: Arc<dyn GraphService> = Arc::new(graph);
        self.graph = Some(graph);
        self
    }

    fn orchestrator(&self) -> Orchestrator {
        let objects: Arc<dyn ObjectStore> = self.objects.clone();
        let coordinator = Arc::new(StorageCoordinator::new(
            objects,
            self.index.clone(),
            StorageLimits {
                max_tokens_per_chunk: self.max_tokens_per_chunk,
                max_document_bytes: 10 * 1024 * 1024,
            },
        ));
        let pool = WorkerPool::new(&self.workers);
        let engines = pool
            .limit_engines(Engines {
                reasoning: self.reasoning.clone(),
                embedding: self.embedding.clone(),
                graph: self.graph.clone(),
                cache: Arc::new(InMemoryEmbeddingCache::new()),
            })
            .unwrap();
        Orchestrator::new(
            coordinator,
            StrategySet::new(engines, &self.strategy),
            pool,
            self.journal.clone(),
            OrchestratorSettings {
                similarity_threshold: 0.1,
                storage_timeout: Duration::from_secs(5),
                retry: fast_retry(),
                ..OrchestratorSettings::default()
            },
        )
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        multiplier: 2.0,
        max_backoff_ms: 5,
    }
}

fn doc(id: &str, content: &str) -> Document {
    Document::new(id, content, DocumentFormat::Markdown, Metadata::new())
}

fn failure_kind(err: &OrchestratorError) -> ErrorKind {
    match err {
        OrchestratorError::Workflow { failure, .. } => failure.kind,
        other => panic!("expected a workflow failure, got {other:?}"),
    }
}

async fn seed(orchestrator: &Orchestrator) {
    for (id, content) in [
        ("deploy", "# Deploy\n\nHow to deploy and rollback the service.\n"),
        ("rollback", "Rollback checklist: rollback the deploy in order.\n"),
        ("garden", "Notes on the garden and the compost heap.\n"),
    ] {
        orchestrator.store_document(doc(id, content)).await.unwrap();
    }
}

// ============ Store ============

#[tokio::test]
async fn test_large_document_is_chunked_and_versioned() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();

    let line = format!("{}\n", vec!["tok"; 100].join(" "));
    let content = line.repeat(100);
    let receipt = orchestrator.store_document(doc("big", &content)).await.unwrap();

    assert_eq!(receipt.version, 1);
    assert_eq!(receipt.chunk_count, 3);
    assert!(receipt.warnings.is_empty());

    let stored = orchestrator.coordinator().get("big").await.unwrap();
    let counts: Vec<usize> = stored.chunks.iter().map(|c| c.token_count).collect();
    assert_eq!(counts, vec![4000, 4000, 2000]);
    assert_eq!(stored.document.token_count, 10_000);
    assert_eq!(stored.document.content, content);
}

#[tokio::test]
async fn test_repeated_store_is_idempotent() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();

    let first = orchestrator.store_document(doc("a", "alpha\n")).await.unwrap();
    let second = orchestrator.store_document(doc("a", "alpha\n")).await.unwrap();
    assert_eq!(first.version, 1);
    assert_eq!(second.version, 1);
    assert_eq!(harness.objects.len(), 1);

    let mut update = doc("a", "alpha beta\n");
    update.version = 1;
    assert_eq!(orchestrator.store_document(update).await.unwrap().version, 2);
}

#[tokio::test]
async fn test_concurrent_updates_have_one_winner() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    orchestrator.store_document(doc("shared", "v1\n")).await.unwrap();

    let mut left = doc("shared", "left edit\n");
    left.version = 1;
    let mut right = doc("shared", "right edit\n");
    right.version = 1;

    let (a, b) = tokio::join!(
        orchestrator.store_document(left),
        orchestrator.store_document(right)
    );
    let outcomes = [a, b];
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(loser.kind(), ErrorKind::Conflict);
    assert_eq!(loser.step(), Some("persist"));

    let latest = orchestrator.coordinator().get("shared").await.unwrap();
    assert_eq!(latest.document.version, 2);
}

#[tokio::test]
async fn test_stale_base_version_conflicts() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    orchestrator.store_document(doc("a", "one\n")).await.unwrap();

    let err = orchestrator.store_document(doc("a", "other\n")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_invalid_document_fails_validation() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();

    let err = orchestrator
        .store_document(doc("bad id", "x\n"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.step(), Some("validate"));
    assert!(harness.objects.is_empty());
}

#[tokio::test]
async fn test_delete_hides_document_and_replays() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    orchestrator.store_document(doc("a", "alpha\n")).await.unwrap();

    let receipt = orchestrator.delete_document("a", 1).await.unwrap();
    assert_eq!(receipt.version, 2);
    let replay = orchestrator.delete_document("a", 1).await.unwrap();
    assert_eq!(replay.version, 2);

    let err = orchestrator.retrieve_document("a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(orchestrator.coordinator().index_entry("a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_index_failure_defers_with_warning_and_reconcile_repairs() {
    let flaky = Arc::new(FlakyIndex {
        inner: InMemoryIndexStore::new(),
        failing: AtomicBool::new(true),
    });
    let mut harness = Harness::new();
    harness.index = flaky.clone();
    let orchestrator = harness.orchestrator();

    let receipt = orchestrator.store_document(doc("a", "alpha\n")).await.unwrap();
    assert_eq!(receipt.version, 1);
    assert_eq!(receipt.warnings.len(), 1);
    assert!(receipt.warnings[0].contains("index update deferred"));
    assert!(orchestrator.coordinator().index_entry("a").await.unwrap().is_none());

    flaky.failing.store(false, Ordering::SeqCst);
    let report = orchestrator.reconcile().await.unwrap();
    assert_eq!(report.repaired, vec!["a".to_string()]);
    let entry = orchestrator.coordinator().index_entry("a").await.unwrap().unwrap();
    assert_eq!(entry.version, 1);
}

// ============ Retrieve ============

#[tokio::test]
async fn test_vector_search_ranks_by_similarity() {
    let harness = Harness::new().with_embedder();
    let orchestrator = harness.orchestrator();
    seed(&orchestrator).await;

    let mut request = RetrievalRequest::new("rollback");
    request.strategy = RequestedStrategy::Vector;
    let results = orchestrator.search_documents(request).await.unwrap();

    let ids: Vec<&str> = results.iter().map(|r| r.document.id.as_str()).collect();
    assert_eq!(ids, vec!["rollback", "deploy"]);
    assert!(results.iter().all(|r| r.strategy == Tier::Vector));
    assert!(results[0].score >= results[1].score);
}

#[tokio::test]
async fn test_hybrid_timeouts_fall_back_to_vector() {
    let reasoner = Arc::new(SlowReasoner::new(Duration::from_secs(5)));
    let mut harness = Harness::new().with_embedder().with_reasoner(reasoner.clone());
    harness.strategy.budgets = LatencyBudgets {
        hybrid: Duration::from_millis(100),
        ..LatencyBudgets::default()
    };
    let orchestrator = harness.orchestrator();
    seed(&orchestrator).await;

    let mut request = RetrievalRequest::new("deploy rollback");
    request.strategy = RequestedStrategy::Hybrid;
    let (id, handle) = orchestrator.spawn_search(request).unwrap();
    let results = handle.await.unwrap().unwrap();

    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.strategy == Tier::Vector));
    assert_eq!(reasoner.calls.load(Ordering::SeqCst), 3);

    let exec = orchestrator.execution(id).await.unwrap().unwrap();
    assert_eq!(exec.attempted_tiers, vec![Tier::Hybrid, Tier::Vector]);
    assert_eq!(exec.retries["strategy:hybrid"], 3);
    assert_eq!(exec.state, WorkflowState::Retrieve(RetrieveState::Completed));
    assert_eq!(exec.warnings.len(), 1);
    // The vector stage of the last hybrid attempt is kept ahead of the fallback.
    assert_eq!(exec.partial_results.len(), 2);
    assert_eq!(exec.partial_results[0].strategy, Tier::Vector);
    assert_eq!(exec.partial_results[1].strategy, Tier::Vector);
}

#[tokio::test]
async fn test_graph_rag_search_ranks_connected_documents() {
    let reasoner = Arc::new(SlowReasoner::new(Duration::from_millis(1)));
    let harness = Harness::new()
        .with_reasoner(reasoner.clone())
        .with_graph(FixedGraph::new("entity:deploy", &[("rollback", 0.9), ("deploy", 0.5)]));
    let orchestrator = harness.orchestrator();
    seed(&orchestrator).await;

    let mut request = RetrievalRequest::new("deploy");
    request.strategy = RequestedStrategy::GraphRag;
    let (id, handle) = orchestrator.spawn_search(request).unwrap();
    let results = handle.await.unwrap().unwrap();

    let ids: Vec<&str> = results.iter().map(|r| r.document.id.as_str()).collect();
    assert_eq!(ids, vec!["rollback", "deploy"]);
    assert!(results.iter().all(|r| r.strategy == Tier::GraphRag));
    assert_eq!(reasoner.calls.load(Ordering::SeqCst), 1);

    let exec = orchestrator.execution(id).await.unwrap().unwrap();
    assert_eq!(exec.attempted_tiers, vec![Tier::GraphRag]);
    assert_eq!(exec.partial_results.len(), 1);
    assert!(exec.warnings.is_empty());
}

#[tokio::test]
async fn test_graph_rag_timeout_keeps_graph_scores_over_vector_fallback() {
    let reasoner = Arc::new(SlowReasoner::new(Duration::from_secs(5)));
    let mut harness = Harness::new()
        .with_embedder()
        .with_reasoner(reasoner.clone())
        .with_graph(FixedGraph::new("entity:deploy", &[("deploy", 0.35)]));
    harness.strategy.budgets = LatencyBudgets {
        graph_rag: Duration::from_millis(100),
        ..LatencyBudgets::default()
    };
    let orchestrator = harness.orchestrator();
    seed(&orchestrator).await;

    let mut request = RetrievalRequest::new("deploy rollback");
    request.strategy = RequestedStrategy::GraphRag;
    let (id, handle) = orchestrator.spawn_search(request).unwrap();
    let results = handle.await.unwrap().unwrap();

    // Vector scores both documents ~0.95; the graph stage already scored
    // "deploy" 0.35 and, as the primary tier, owns that score.
    let ranked: Vec<(&str, Tier)> = results
        .iter()
        .map(|r| (r.document.id.as_str(), r.strategy))
        .collect();
    assert_eq!(
        ranked,
        vec![("rollback", Tier::Vector), ("deploy", Tier::GraphRag)]
    );
    assert_eq!(results[1].score, 0.35);
    assert!(results[0].score > 0.9);
    assert_eq!(reasoner.calls.load(Ordering::SeqCst), 3);

    let exec = orchestrator.execution(id).await.unwrap().unwrap();
    assert_eq!(exec.attempted_tiers, vec![Tier::GraphRag, Tier::Vector]);
    assert_eq!(exec.retries["strategy:graph_rag"], 3);
    let tiers: Vec<Tier> = exec.partial_results.iter().map(|r| r.strategy).collect();
    assert_eq!(tiers, vec![Tier::GraphRag, Tier::Vector]);
}

#[tokio::test]
async fn test_reasoning_calls_share_worker_limit_across_strategies() {
    let reasoner = Arc::new(SlowReasoner::new(Duration::from_millis(100)));
    let mut harness = Harness::new()
        .with_reasoner(reasoner.clone())
        .with_graph(FixedGraph::new("entity:deploy", &[("deploy", 0.9), ("rollback", 0.5)]));
    harness.workers = WorkersConfig {
        reasoning: 1,
        graph: 4,
        ..WorkersConfig::default()
    };
    let orchestrator = harness.orchestrator();
    seed(&orchestrator).await;

    let mut direct = RetrievalRequest::new("deploy");
    direct.strategy = RequestedStrategy::Reasoning;
    let mut graph = RetrievalRequest::new("deploy");
    graph.strategy = RequestedStrategy::GraphRag;

    let (a, b) = tokio::join!(
        orchestrator.search_documents(direct),
        orchestrator.search_documents(graph)
    );
    assert!(a.unwrap().iter().all(|r| r.strategy == Tier::Reasoning));
    assert!(b.unwrap().iter().all(|r| r.strategy == Tier::GraphRag));
    assert_eq!(reasoner.calls.load(Ordering::SeqCst), 2);
    assert_eq!(reasoner.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_engines_fall_back_to_metadata_only() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    seed(&orchestrator).await;

    let mut request = RetrievalRequest::new("compost garden");
    request.strategy = RequestedStrategy::Reasoning;
    let (id, handle) = orchestrator.spawn_search(request).unwrap();
    let results = handle.await.unwrap().unwrap();

    assert_eq!(results[0].document.id, "garden");
    assert!(results.iter().all(|r| r.strategy == Tier::MetadataOnly));

    let exec = orchestrator.execution(id).await.unwrap().unwrap();
    assert_eq!(
        exec.attempted_tiers,
        vec![Tier::Reasoning, Tier::Vector, Tier::MetadataOnly]
    );
}

#[tokio::test]
async fn test_auto_without_engines_still_answers() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    seed(&orchestrator).await;

    let results = orchestrator
        .search_documents(RetrievalRequest::new("deploy"))
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].strategy, Tier::MetadataOnly);
}

#[tokio::test]
async fn test_search_respects_filter_and_limit() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    for (id, team) in [("a", "infra"), ("b", "infra"), ("c", "data")] {
        let mut d = doc(id, "deploy notes\n");
        d.metadata.insert("team".into(), team.into());
        orchestrator.store_document(d).await.unwrap();
    }

    let mut request = RetrievalRequest::new("deploy");
    request.filter = MetadataFilter::all_of(vec![("team".into(), "infra".into())]);
    let results = orchestrator.search_documents(request.clone()).await.unwrap();
    let mut ids: Vec<&str> = results.iter().map(|r| r.document.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);

    request.limit = 1;
    assert_eq!(orchestrator.search_documents(request).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_running() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();

    let err = orchestrator
        .search_documents(RetrievalRequest::new("   "))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut request = RetrievalRequest::new("q");
    request.limit = 0;
    assert!(orchestrator.spawn_search(request).is_err());
}

// ============ Cancellation and resume ============

#[tokio::test]
async fn test_cancelled_search_fails_with_cancelled_kind() {
    let reasoner = Arc::new(SlowReasoner::new(Duration::from_millis(200)));
    let harness = Harness::new().with_reasoner(reasoner);
    let orchestrator = harness.orchestrator();
    seed(&orchestrator).await;

    let mut request = RetrievalRequest::new("deploy");
    request.strategy = RequestedStrategy::Reasoning;
    let (id, handle) = orchestrator.spawn_search(request).unwrap();
    let snapshot = orchestrator.cancel(id).await.unwrap().unwrap();
    assert!(snapshot.cancel_requested);

    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(failure_kind(&err), ErrorKind::Cancelled);

    let exec = orchestrator.execution(id).await.unwrap().unwrap();
    assert_eq!(exec.state, WorkflowState::Retrieve(RetrieveState::Failed));
    assert_eq!(exec.failure.unwrap().kind, ErrorKind::Cancelled);
}

#[tokio::test]
async fn test_cancel_unknown_workflow_is_none() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    assert!(orchestrator.cancel(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_resume_finishes_interrupted_store() {
    let harness = Harness::new();

    let mut exec = WorkflowExecution::new_store(doc("a", "alpha\nbeta\n"));
    exec.advance(Event::Validated, None).unwrap();
    exec.advance(Event::Chunked, None).unwrap();
    harness.journal.save(&exec).await.unwrap();

    let orchestrator = harness.orchestrator();
    let report = orchestrator.resume_incomplete().await.unwrap();
    assert_eq!(report.completed, vec![exec.id]);
    assert!(report.failed.is_empty());

    let resumed = orchestrator.execution(exec.id).await.unwrap().unwrap();
    assert_eq!(resumed.state, WorkflowState::Store(StoreState::Completed));
    let stored = orchestrator.coordinator().get("a").await.unwrap();
    assert_eq!(stored.document.version, 1);
    assert!(orchestrator.coordinator().index_entry("a").await.unwrap().is_some());

    assert!(harness.journal.list_unfinished().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_retrieve_keeps_original_candidates() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    orchestrator.store_document(doc("a", "deploy guide\n")).await.unwrap();

    let mut exec = WorkflowExecution::new_retrieve(RetrievalRequest::new("deploy"));
    exec.candidate_ids = vec!["a".to_string()];
    exec.current_tier = Some(Tier::MetadataOnly);
    exec.advance(Event::CandidatesFetched, None).unwrap();
    harness.journal.save(&exec).await.unwrap();

    // Stored after the interrupted workflow fetched its candidates.
    orchestrator.store_document(doc("b", "deploy runbook\n")).await.unwrap();

    let restarted = harness.orchestrator();
    let report = restarted.resume_incomplete().await.unwrap();
    assert_eq!(report.completed, vec![exec.id]);

    let resumed = restarted.execution(exec.id).await.unwrap().unwrap();
    let hits = match resumed.output {
        Some(WorkflowOutput::Retrieved { hits }) => hits,
        other => panic!("unexpected output {other:?}"),
    };
    let ids: Vec<&str> = hits.iter().map(|h| h.document_id.as_str()).collect();
    assert_eq!(ids, vec!["a"]);
}

#[tokio::test]
async fn test_finished_workflows_leave_the_arena() {
    let mut harness = Harness::new();
    harness.journal = Arc::new(WriteOnlyJournal {
        inner: InMemoryJournal::new(),
    });
    let orchestrator = harness.orchestrator();
    seed(&orchestrator).await;

    let mut ids = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..20 {
        let (id, handle) = orchestrator
            .spawn_search(RetrievalRequest::new("deploy"))
            .unwrap();
        ids.push(id);
        handles.push(handle);
    }
    let (store_id, store) = orchestrator.spawn_store(doc("late", "late arrival\n"));
    for handle in handles {
        assert!(!handle.await.unwrap().unwrap().is_empty());
    }
    store.await.unwrap().unwrap();
    ids.push(store_id);

    // Only the journal could answer now, and this one never does.
    for id in ids {
        assert!(orchestrator.execution(id).await.unwrap().is_none());
    }
    assert_eq!(orchestrator.health_check().await.running_workflows, 0);
}

// ============ Health ============

#[tokio::test]
async fn test_health_reports_capabilities_and_workers() {
    let harness = Harness::new().with_embedder();
    let orchestrator = harness.orchestrator();

    let report = orchestrator.health_check().await;
    assert_eq!(report.status, "ok");
    assert!(report.object_store && report.index);
    assert!(report.capabilities.embeddings);
    assert!(!report.capabilities.reasoning);
    assert_eq!(report.running_workflows, 0);

    let defaults = WorkersConfig::default();
    assert_eq!(report.available_workers["reasoning"], defaults.reasoning);
    assert_eq!(report.available_workers["chunking"], defaults.chunking);
}
