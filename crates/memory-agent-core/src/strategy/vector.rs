//! Vector similarity strategy.
//!
//! # Algorithm
//!
//! 1. Embed the query.
//! 2. For each candidate chunk, reuse its stored embedding when the model
//!    version matches, else the cached vector, else embed the chunk and
//!    cache the result.
//! 3. Score each document by its best chunk's cosine similarity.
//! 4. Drop documents below the similarity threshold.
//! 5. Sort by score (desc), then document id (asc).
//!
//! Deterministic given fixed embeddings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::embedding::{cosine_similarity, EmbeddingCache, EmbeddingEngine};
use crate::error::{MemoryError, MemoryResult};
use crate::models::{CandidateSet, DocumentChunk, ScoredId, StrategyResult, Tier};

use super::{sort_by_score_desc, StrategyExecutor, StrategyQuery};

pub struct VectorStrategy {
    embedder: Option<Arc<dyn EmbeddingEngine>>,
    cache: Arc<dyn EmbeddingCache>,
    budget: Duration,
}

impl VectorStrategy {
    pub fn new(
        embedder: Option<Arc<dyn EmbeddingEngine>>,
        cache: Arc<dyn EmbeddingCache>,
        budget: Duration,
    ) -> Self {
        Self {
            embedder,
            cache,
            budget,
        }
    }

    /// Score every candidate above the threshold, best first.
    pub async fn score(&self, query: &StrategyQuery, candidates: &CandidateSet) -> MemoryResult<Vec<ScoredId>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| MemoryError::unavailable("embedding engine"))?;
        let query_embedding = embedder.embed(&query.text).await?;
        let model = query_embedding.model_version.as_str();

        let mut scored: Vec<(String, f64)> = Vec::new();
        for candidate in candidates.iter() {
            let mut best: Option<f64> = None;
            for chunk in &candidate.chunks {
                let vector = self.chunk_vector(&**embedder, chunk, model).await?;
                let sim = cosine_similarity(&query_embedding.vector, &vector) as f64;
                best = Some(best.map_or(sim, |b| b.max(sim)));
            }
            if let Some(score) = best {
                if score >= query.similarity_threshold {
                    scored.push((candidate.document.id.clone(), score));
                }
            }
        }

        scored.sort_by(|a, b| a.0.cmp(&b.0));
        sort_by_score_desc(&mut scored);
        Ok(scored
            .into_iter()
            .map(|(id, score)| ScoredId::new(id, score))
            .collect())
    }

    async fn chunk_vector(
        &self,
        embedder: &dyn EmbeddingEngine,
        chunk: &DocumentChunk,
        model: &str,
    ) -> MemoryResult<Vec<f32>> {
        if let (Some(vector), Some(version)) = (&chunk.embedding, &chunk.embedding_model_version) {
            if version == model {
                return Ok(vector.clone());
            }
        }

        match self.cache.get(&chunk.content_hash, model).await {
            Ok(Some(vector)) => return Ok(vector),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "embedding cache read failed; recomputing"),
        }

        let embedding = embedder.embed(&chunk.content).await?;
        if let Err(e) = self
            .cache
            .put(&chunk.content_hash, &embedding.model_version, &embedding.vector)
            .await
        {
            tracing::warn!(error = %e, "embedding cache write failed");
        }
        Ok(embedding.vector)
    }
}

#[async_trait]
impl StrategyExecutor for VectorStrategy {
    fn tier(&self) -> Tier {
        Tier::Vector
    }

    fn latency_budget(&self) -> Option<Duration> {
        Some(self.budget)
    }

    async fn retrieve(&self, query: &StrategyQuery, candidates: &CandidateSet) -> MemoryResult<StrategyResult> {
        let hits = self.score(query, candidates).await?;
        let mut result = StrategyResult::empty(Tier::Vector);
        result.diagnostics.insert("candidates".into(), json!(candidates.len()));
        result
            .diagnostics
            .insert("threshold".into(), json!(query.similarity_threshold));
        result.diagnostics.insert("above_threshold".into(), json!(hits.len()));
        result.hits = hits;
        Ok(result)
    }
}
