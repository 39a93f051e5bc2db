//! Hybrid strategy: vector narrowing, then reasoning over the survivors.
//!
//! The vector stage bounds the reasoning stage to at most `vector_k`
//! documents. The order is fixed; if the reasoning stage fails, the whole
//! invocation fails and the policy engine falls back to the vector tier.
//! The vector ranking is recorded as partial output first, labelled
//! `vector` since those are the scores it carries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::MemoryResult;
use crate::models::{CandidateSet, StrategyResult, Tier};

use super::{PartialOutput, ReasoningStrategy, StrategyExecutor, StrategyQuery, VectorStrategy};

pub struct HybridStrategy {
    vector: Arc<VectorStrategy>,
    reasoning: Arc<ReasoningStrategy>,
    vector_k: usize,
    budget: Duration,
}

impl HybridStrategy {
    pub fn new(
        vector: Arc<VectorStrategy>,
        reasoning: Arc<ReasoningStrategy>,
        vector_k: usize,
        budget: Duration,
    ) -> Self {
        Self {
            vector,
            reasoning,
            vector_k: vector_k.max(1),
            budget,
        }
    }
}

#[async_trait]
impl StrategyExecutor for HybridStrategy {
    fn tier(&self) -> Tier {
        Tier::Hybrid
    }

    fn latency_budget(&self) -> Option<Duration> {
        Some(self.budget)
    }

    async fn retrieve(&self, query: &StrategyQuery, candidates: &CandidateSet) -> MemoryResult<StrategyResult> {
        self.retrieve_staged(query, candidates, &PartialOutput::default())
            .await
    }

    async fn retrieve_staged(
        &self,
        query: &StrategyQuery,
        candidates: &CandidateSet,
        partial: &PartialOutput,
    ) -> MemoryResult<StrategyResult> {
        let mut vector_hits = self.vector.score(query, candidates).await?;
        vector_hits.truncate(self.vector_k);

        let mut result = StrategyResult::empty(Tier::Hybrid);
        result.diagnostics.insert("vector_hits".into(), json!(vector_hits.len()));
        if vector_hits.is_empty() {
            return Ok(result);
        }

        let mut stage = StrategyResult::empty(Tier::Vector);
        stage.diagnostics.insert("stage".into(), json!("hybrid_vector"));
        stage.hits = vector_hits.clone();
        partial.record(stage);

        let ids: Vec<String> = vector_hits.into_iter().map(|h| h.document_id).collect();
        let narrowed = candidates.select(&ids);
        let ranking = self.reasoning.rank(&query.text, &narrowed, query.limit).await?;
        result.diagnostics.extend(ranking.diagnostics());
        result.hits = ranking.hits;
        Ok(result)
    }
}
