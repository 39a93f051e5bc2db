//! Metadata-only tier, the bottom of the fallback chain.
//!
//! Returns every candidate that passed the metadata filter, scored by the
//! fraction of query terms found in its content. Ties go to the most
//! recently updated document. Calls no collaborator and has no latency
//! budget, so it cannot fail.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::MemoryResult;
use crate::models::{CandidateSet, ScoredId, StoredDocument, StrategyResult, Tier};

use super::{query_terms, StrategyExecutor, StrategyQuery};

pub struct MetadataOnlyStrategy;

#[async_trait]
impl StrategyExecutor for MetadataOnlyStrategy {
    fn tier(&self) -> Tier {
        Tier::MetadataOnly
    }

    fn latency_budget(&self) -> Option<Duration> {
        None
    }

    async fn retrieve(&self, query: &StrategyQuery, candidates: &CandidateSet) -> MemoryResult<StrategyResult> {
        let terms = query_terms(&query.text);
        let mut scored: Vec<(f64, &StoredDocument)> = candidates
            .iter()
            .map(|c| {
                let score = if terms.is_empty() {
                    0.0
                } else {
                    let content = c.document.content.to_lowercase();
                    let matched = terms.iter().filter(|t| content.contains(t.as_str())).count();
                    matched as f64 / terms.len() as f64
                };
                (score, c)
            })
            .collect();

        scored.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.document.updated_at.cmp(&a.document.updated_at))
                .then_with(|| a.document.id.cmp(&b.document.id))
        });

        let mut result = StrategyResult::empty(Tier::MetadataOnly);
        result.diagnostics.insert("terms".into(), json!(terms));
        result.hits = scored
            .into_iter()
            .map(|(score, c)| ScoredId::new(c.document.id.clone(), score))
            .collect();
        Ok(result)
    }
}
