//! Graph-augmented retrieval.
//!
//! Query terms become seed entities (`entity:<term>`). The graph service
//! returns documents connected to those seeds with edge weights; the ones
//! present in the candidate set, ordered by weight, are handed to the
//! reasoning stage. The weight ranking is recorded as partial output
//! before the reasoning stage runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::GraphService;
use crate::error::{MemoryError, MemoryResult};
use crate::models::{CandidateSet, ScoredId, StrategyResult, Tier};

use super::{
    query_terms, sort_by_score_desc, PartialOutput, ReasoningStrategy, StrategyExecutor, StrategyQuery,
};

/// Prefix for entity node ids in the knowledge graph.
pub const ENTITY_PREFIX: &str = "entity:";

pub struct GraphRagStrategy {
    graph: Option<Arc<dyn GraphService>>,
    reasoning: Arc<ReasoningStrategy>,
    max_depth: u32,
    max_seeds: usize,
    budget: Duration,
}

/// Seed entity ids for a query.
pub fn seed_entities(query: &str, max_seeds: usize) -> Vec<String> {
    query_terms(query)
        .into_iter()
        .take(max_seeds)
        .map(|t| format!("{ENTITY_PREFIX}{t}"))
        .collect()
}

impl GraphRagStrategy {
    pub fn new(
        graph: Option<Arc<dyn GraphService>>,
        reasoning: Arc<ReasoningStrategy>,
        max_depth: u32,
        max_seeds: usize,
        budget: Duration,
    ) -> Self {
        Self {
            graph,
            reasoning,
            max_depth,
            max_seeds: max_seeds.max(1),
            budget,
        }
    }
}

#[async_trait]
impl StrategyExecutor for GraphRagStrategy {
    fn tier(&self) -> Tier {
        Tier::GraphRag
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
        let graph = self
            .graph
            .as_ref()
            .ok_or_else(|| MemoryError::unavailable("graph service"))?;

        let mut result = StrategyResult::empty(Tier::GraphRag);
        let seeds = seed_entities(&query.text, self.max_seeds);
        result.diagnostics.insert("seeds".into(), json!(seeds));
        if seeds.is_empty() {
            return Ok(result);
        }

        let edges = graph.connected(&seeds, self.max_depth).await?;
        let mut connected: Vec<(String, f64)> = Vec::new();
        for edge in edges {
            if !candidates.contains(&edge.document_id) || !edge.weight.is_finite() {
                continue;
            }
            match connected.iter_mut().find(|(id, _)| *id == edge.document_id) {
                Some((_, weight)) => *weight = weight.max(edge.weight),
                None => connected.push((edge.document_id, edge.weight)),
            }
        }
        sort_by_score_desc(&mut connected);
        result.diagnostics.insert("connected".into(), json!(connected.len()));
        if connected.is_empty() {
            return Ok(result);
        }

        let mut stage = StrategyResult::empty(Tier::GraphRag);
        stage.diagnostics.insert("stage".into(), json!("graph"));
        stage.hits = connected
            .iter()
            .map(|(id, weight)| ScoredId::new(id.clone(), *weight))
            .collect();
        partial.record(stage);

        let ids: Vec<String> = connected.into_iter().map(|(id, _)| id).collect();
        let related = candidates.select(&ids);
        let ranking = self.reasoning.rank(&query.text, &related, query.limit).await?;
        result.diagnostics.extend(ranking.diagnostics());
        result.hits = ranking.hits;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::engine::{GraphEdge, ReasoningEngine};
    use crate::strategy::testing::{candidates, FixedGraph, ScriptedReasoner};

    fn edge(id: &str, weight: f64) -> GraphEdge {
        GraphEdge {
            document_id: id.into(),
            weight,
        }
    }

    #[test]
    fn test_seed_entities() {
        assert_eq!(
            seed_entities("Where is the billing service?", 8),
            vec!["entity:where", "entity:billing", "entity:service"]
        );
        assert_eq!(seed_entities("billing service", 1), vec!["entity:billing"]);
    }

    #[tokio::test]
    async fn test_connected_candidates_ordered_by_weight() {
        let mut edges = HashMap::new();
        edges.insert(
            "entity:billing".to_string(),
            vec![edge("low", 0.2), edge("high", 0.9), edge("outside", 1.0)],
        );
        let graph = Arc::new(FixedGraph {
            edges,
            seen_seeds: Mutex::new(Vec::new()),
        });
        let reasoner = Arc::new(ScriptedReasoner::new());
        let reasoning = Arc::new(ReasoningStrategy::new(
            Some(reasoner.clone() as Arc<dyn ReasoningEngine>),
            Duration::from_secs(1),
            1000,
            128,
            5,
        ));
        let strategy = GraphRagStrategy::new(
            Some(graph.clone() as Arc<dyn GraphService>),
            reasoning,
            3,
            8,
            Duration::from_secs(1),
        );
        let set = candidates(&[
            ("low", "billing low\n"),
            ("high", "billing high\n"),
            ("other", "billing unrelated\n"),
        ]);
        let query = StrategyQuery {
            text: "billing".into(),
            similarity_threshold: 0.0,
            limit: 10,
        };
        let result = strategy.retrieve(&query, &set).await.unwrap();

        assert_eq!(*graph.seen_seeds.lock().unwrap(), vec!["entity:billing"]);
        let requests = reasoner.requests.lock().unwrap();
        let shown: Vec<_> = requests[0]
            .candidates
            .iter()
            .map(|c| c.document_id.as_str())
            .collect();
        assert_eq!(shown, vec!["high", "low"]);
        let ids: Vec<_> = result.hits.iter().map(|h| h.document_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_no_connected_documents_is_empty_result() {
        let graph = Arc::new(FixedGraph {
            edges: HashMap::new(),
            seen_seeds: Mutex::new(Vec::new()),
        });
        let reasoner = Arc::new(ScriptedReasoner::new());
        let reasoning = Arc::new(ReasoningStrategy::new(
            Some(reasoner.clone() as Arc<dyn ReasoningEngine>),
            Duration::from_secs(1),
            1000,
            128,
            5,
        ));
        let strategy = GraphRagStrategy::new(
            Some(graph as Arc<dyn GraphService>),
            reasoning,
            3,
            8,
            Duration::from_secs(1),
        );
        let query = StrategyQuery {
            text: "billing".into(),
            similarity_threshold: 0.0,
            limit: 10,
        };
        let result = strategy
            .retrieve(&query, &candidates(&[("a", "billing\n")]))
            .await
            .unwrap();
        assert!(result.hits.is_empty());
        assert!(reasoner.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_weight_ranking_recorded_before_reasoning() {
        let mut edges = HashMap::new();
        edges.insert(
            "entity:billing".to_string(),
            vec![edge("low", 0.2), edge("high", 0.9)],
        );
        let graph = Arc::new(FixedGraph {
            edges,
            seen_seeds: Mutex::new(Vec::new()),
        });
        let reasoning = Arc::new(ReasoningStrategy::new(None, Duration::from_secs(1), 1000, 128, 5));
        let strategy = GraphRagStrategy::new(
            Some(graph as Arc<dyn GraphService>),
            reasoning,
            3,
            8,
            Duration::from_secs(1),
        );
        let query = StrategyQuery {
            text: "billing".into(),
            similarity_threshold: 0.0,
            limit: 10,
        };
        let partial = PartialOutput::default();
        let set = candidates(&[("low", "billing low\n"), ("high", "billing high\n")]);
        let err = strategy.retrieve_staged(&query, &set, &partial).await.unwrap_err();
        assert!(matches!(err, MemoryError::Unavailable { .. }));

        let stage = partial.take().unwrap();
        assert_eq!(stage.strategy, Tier::GraphRag);
        let hits: Vec<_> = stage
            .hits
            .iter()
            .map(|h| (h.document_id.as_str(), h.score))
            .collect();
        assert_eq!(hits, vec![("high", 0.9), ("low", 0.2)]);
    }
}
