//! Retrieval strategy executors.
//!
//! Every strategy implements [`StrategyExecutor`] and ranks a
//! [`CandidateSet`] for a query. The orchestrator never inspects which
//! executor it holds; it dispatches by [`Tier`] through a [`StrategySet`]
//! and lets the policy engine decide what happens on failure.
//!
//! | Tier | Executor | Collaborators |
//! |------|----------|---------------|
//! | `vector` | [`VectorStrategy`] | embedding engine, embedding cache |
//! | `reasoning` | [`ReasoningStrategy`] | reasoning engine |
//! | `hybrid` | [`HybridStrategy`] | vector stage, then reasoning stage |
//! | `graph_rag` | [`GraphRagStrategy`] | graph service, then reasoning stage |
//! | `metadata_only` | [`MetadataOnlyStrategy`] | none; unbounded, cannot fail |
//!
//! A missing collaborator surfaces as
//! [`MemoryError::Unavailable`](crate::error::MemoryError::Unavailable),
//! which the policy engine turns into an immediate fallback.
//!
//! The composite strategies record the output of a finished stage in a
//! [`PartialOutput`] before running the next one. When the later stage
//! fails or times out, the orchestrator keeps that output and merges it
//! with the fallback tier's result.

pub mod graph;
pub mod hybrid;
pub mod metadata;
pub mod reasoning;
pub mod vector;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::embedding::{EmbeddingCache, EmbeddingEngine};
use crate::engine::{Capabilities, GraphService, ReasoningEngine};
use crate::error::MemoryResult;
use crate::models::{CandidateSet, RequestedStrategy, StrategyResult, Tier};

pub use graph::GraphRagStrategy;
pub use hybrid::HybridStrategy;
pub use metadata::MetadataOnlyStrategy;
pub use reasoning::ReasoningStrategy;
pub use vector::VectorStrategy;

/// What an executor is asked to rank.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyQuery {
    pub text: String,
    /// Minimum cosine similarity for vector-bearing strategies.
    pub similarity_threshold: f64,
    /// How many results the caller wants.
    pub limit: usize,
}

/// Output of a completed stage of a composite strategy.
///
/// Lives outside the strategy future, so it survives the future being
/// dropped on timeout. The last recorded result wins.
#[derive(Debug, Default)]
pub struct PartialOutput {
    result: Mutex<Option<StrategyResult>>,
}

impl PartialOutput {
    pub fn record(&self, result: StrategyResult) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
    }

    pub fn take(&self) -> Option<StrategyResult> {
        self.result.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Capability interface shared by all strategies.
#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    fn tier(&self) -> Tier;

    /// Maximum wall time the worker pool allows one invocation. `None`
    /// runs unbounded.
    fn latency_budget(&self) -> Option<Duration>;

    /// Rank `candidates` for `query`. Hits must be ids from `candidates`,
    /// ordered best first.
    async fn retrieve(&self, query: &StrategyQuery, candidates: &CandidateSet) -> MemoryResult<StrategyResult>;

    /// [`retrieve`](Self::retrieve), recording finished stages in `partial`.
    /// Single-stage strategies have nothing to record.
    async fn retrieve_staged(
        &self,
        query: &StrategyQuery,
        candidates: &CandidateSet,
        _partial: &PartialOutput,
    ) -> MemoryResult<StrategyResult> {
        self.retrieve(query, candidates).await
    }
}

/// Per-tier latency budgets.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyBudgets {
    pub vector: Duration,
    pub reasoning: Duration,
    pub hybrid: Duration,
    pub graph_rag: Duration,
}

impl Default for LatencyBudgets {
    fn default() -> Self {
        Self {
            vector: Duration::from_millis(2_000),
            reasoning: Duration::from_millis(30_000),
            hybrid: Duration::from_millis(35_000),
            graph_rag: Duration::from_millis(40_000),
        }
    }
}

/// Tuning shared by the executors.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySettings {
    pub budgets: LatencyBudgets,
    /// Tokens of candidate content one reasoning call may carry.
    pub context_budget_tokens: usize,
    pub max_output_tokens: u32,
    /// Selections requested per batch when shortlisting.
    pub shortlist_size: usize,
    /// Vector hits handed to the reasoning stage of the hybrid strategy.
    pub hybrid_vector_k: usize,
    pub graph_max_depth: u32,
    pub graph_max_seeds: usize,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            budgets: LatencyBudgets::default(),
            context_budget_tokens: 12_000,
            max_output_tokens: 1_024,
            shortlist_size: 5,
            hybrid_vector_k: 20,
            graph_max_depth: 3,
            graph_max_seeds: 8,
        }
    }
}

/// The configured collaborators. `None` means not configured.
#[derive(Clone)]
pub struct Engines {
    pub reasoning: Option<Arc<dyn ReasoningEngine>>,
    pub embedding: Option<Arc<dyn EmbeddingEngine>>,
    pub graph: Option<Arc<dyn GraphService>>,
    pub cache: Arc<dyn EmbeddingCache>,
}

impl Engines {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            reasoning: self.reasoning.is_some(),
            embeddings: self.embedding.is_some(),
            graph: self.graph.is_some(),
        }
    }
}

/// One executor per tier, built once from the configured engines.
#[derive(Clone)]
pub struct StrategySet {
    vector: Arc<VectorStrategy>,
    reasoning: Arc<ReasoningStrategy>,
    hybrid: Arc<HybridStrategy>,
    graph: Arc<GraphRagStrategy>,
    metadata: Arc<MetadataOnlyStrategy>,
    capabilities: Capabilities,
}

impl StrategySet {
    pub fn new(engines: Engines, settings: &StrategySettings) -> Self {
        let capabilities = engines.capabilities();
        let vector = Arc::new(VectorStrategy::new(
            engines.embedding.clone(),
            engines.cache.clone(),
            settings.budgets.vector,
        ));
        let reasoning = Arc::new(ReasoningStrategy::new(
            engines.reasoning.clone(),
            settings.budgets.reasoning,
            settings.context_budget_tokens,
            settings.max_output_tokens,
            settings.shortlist_size,
        ));
        let hybrid = Arc::new(HybridStrategy::new(
            vector.clone(),
            reasoning.clone(),
            settings.hybrid_vector_k,
            settings.budgets.hybrid,
        ));
        let graph = Arc::new(GraphRagStrategy::new(
            engines.graph.clone(),
            reasoning.clone(),
            settings.graph_max_depth,
            settings.graph_max_seeds,
            settings.budgets.graph_rag,
        ));
        let metadata = Arc::new(MetadataOnlyStrategy);
        Self {
            vector,
            reasoning,
            hybrid,
            graph,
            metadata,
            capabilities,
        }
    }

    pub fn get(&self, tier: Tier) -> Arc<dyn StrategyExecutor> {
        match tier {
            Tier::Vector => self.vector.clone(),
            Tier::Reasoning => self.reasoning.clone(),
            Tier::Hybrid => self.hybrid.clone(),
            Tier::GraphRag => self.graph.clone(),
            Tier::MetadataOnly => self.metadata.clone(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

/// Resolve the tier to dispatch first.
///
/// An explicit request wins; otherwise a non-`auto` configured default;
/// otherwise the richest strategy the configured collaborators support.
pub fn select_strategy(
    requested: RequestedStrategy,
    default: RequestedStrategy,
    capabilities: Capabilities,
) -> Tier {
    if let Some(tier) = requested.tier().or_else(|| default.tier()) {
        return tier;
    }
    match (capabilities.reasoning, capabilities.embeddings) {
        (true, true) => Tier::Hybrid,
        (true, false) => Tier::Reasoning,
        (false, _) => Tier::Vector,
    }
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "what", "which", "who", "how", "are", "was", "were", "this",
    "that", "from", "about", "into", "does", "have", "has", "not", "but", "you", "your",
];

/// Distinct lowercase query terms of three or more characters, minus stop
/// words, in first-occurrence order.
pub fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-') {
        let term = raw.trim_matches('-').to_lowercase();
        if term.chars().count() < 3 || STOP_WORDS.contains(&term.as_str()) {
            continue;
        }
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Sort scored pairs best first; ties keep their incoming order.
pub(crate) fn sort_by_score_desc<T>(items: &mut [(T, f64)]) {
    items.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process fakes shared by the strategy tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::chunk::build_chunks;
    use crate::embedding::{Embedding, EmbeddingEngine};
    use crate::engine::{GraphEdge, GraphService, ReasoningEngine, ReasoningRequest, ReasoningResponse, Selection};
    use crate::error::MemoryResult;
    use crate::models::{CandidateSet, Document, DocumentFormat, Metadata, StoredDocument};

    pub fn candidates(docs: &[(&str, &str)]) -> CandidateSet {
        CandidateSet::new(
            docs.iter()
                .map(|(id, content)| {
                    let document = Document::new(*id, *content, DocumentFormat::Markdown, Metadata::new());
                    let chunks = build_chunks(id, content, 1000).unwrap();
                    StoredDocument { document, chunks }
                })
                .collect(),
        )
    }

    /// Embeds text as keyword-presence counts over a fixed vocabulary.
    pub struct KeywordEmbedder {
        pub vocabulary: Vec<&'static str>,
        pub calls: AtomicUsize,
    }

    impl KeywordEmbedder {
        pub fn new(vocabulary: &[&'static str]) -> Self {
            Self {
                vocabulary: vocabulary.to_vec(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingEngine for KeywordEmbedder {
        fn model_version(&self) -> &str {
            "keyword-v1"
        }

        async fn embed(&self, text: &str) -> MemoryResult<Embedding> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let lower = text.to_lowercase();
            let vector = self
                .vocabulary
                .iter()
                .map(|w| lower.matches(w).count() as f32)
                .collect();
            Ok(Embedding {
                vector,
                model_version: "keyword-v1".to_string(),
            })
        }
    }

    /// Selects candidates whose content contains the query's first word,
    /// optionally mentioning a foreign id first.
    pub struct ScriptedReasoner {
        pub requests: Mutex<Vec<ReasoningRequest>>,
        pub inject_unknown: bool,
    }

    impl ScriptedReasoner {
        pub fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                inject_unknown: false,
            }
        }
    }

    #[async_trait]
    impl ReasoningEngine for ScriptedReasoner {
        async fn reason(&self, request: &ReasoningRequest) -> MemoryResult<ReasoningResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let needle = request
                .query
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_lowercase();
            let mut selections = Vec::new();
            if self.inject_unknown {
                selections.push(Selection {
                    document_id: "not-a-candidate".into(),
                    confidence: Some(1.0),
                });
            }
            for c in &request.candidates {
                if c.content.to_lowercase().contains(&needle) {
                    selections.push(Selection {
                        document_id: c.document_id.clone(),
                        confidence: None,
                    });
                }
            }
            selections.truncate(request.max_selections.max(1) + usize::from(self.inject_unknown));
            Ok(ReasoningResponse {
                selections,
                rationale: Some("matched on first query word".into()),
            })
        }
    }

    pub struct FixedGraph {
        pub edges: HashMap<String, Vec<GraphEdge>>,
        pub seen_seeds: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GraphService for FixedGraph {
        async fn connected(&self, seeds: &[String], _max_depth: u32) -> MemoryResult<Vec<GraphEdge>> {
            self.seen_seeds.lock().unwrap().extend(seeds.iter().cloned());
            Ok(seeds
                .iter()
                .filter_map(|s| self.edges.get(s))
                .flatten()
                .cloned()
                .collect())
        }
    }
}
