//! Pure reasoning strategy: ask the reasoning engine to select documents.
//!
//! # Context budgeting
//!
//! 1. Available tokens = `context_budget_tokens` minus the query's tokens.
//! 2. A candidate larger than the whole budget is truncated to fit.
//! 3. If every candidate fits, issue one final call.
//! 4. Otherwise pack candidates into sequential batches that each fit, ask
//!    the engine to shortlist each batch, and repeat over the union of
//!    shortlists until it fits. If a round makes no progress, keep the
//!    longest prefix of the shortlist that fits.
//! 5. Issue the final call over what remains.
//!
//! Ids the engine returns that were not in its request are ignored.
//! Scores are the engine's confidence when given, else rank-derived:
//! `(n - rank) / n` for `n` selections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::chunk::{count_tokens, truncate_tokens};
use crate::engine::{ReasoningCandidate, ReasoningEngine, ReasoningMode, ReasoningRequest, ReasoningResponse};
use crate::error::{MemoryError, MemoryResult};
use crate::models::{CandidateSet, ScoredId, StoredDocument, StrategyResult, Tier};

use super::{StrategyExecutor, StrategyQuery};

pub struct ReasoningStrategy {
    reasoner: Option<Arc<dyn ReasoningEngine>>,
    budget: Duration,
    context_budget_tokens: usize,
    max_output_tokens: u32,
    shortlist_size: usize,
}

/// Outcome of one ranking pass, including call accounting.
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    pub hits: Vec<ScoredId>,
    pub calls: usize,
    pub shortlist_rounds: usize,
    pub truncated: usize,
    pub rationale: Option<String>,
}

impl Ranking {
    pub fn diagnostics(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("reasoning_calls".into(), json!(self.calls));
        map.insert("shortlist_rounds".into(), json!(self.shortlist_rounds));
        map.insert("truncated_candidates".into(), json!(self.truncated));
        if let Some(rationale) = &self.rationale {
            map.insert("rationale".into(), json!(rationale));
        }
        map
    }
}

#[derive(Debug, Clone)]
struct Packed {
    id: String,
    content: String,
    tokens: usize,
}

fn total_tokens(items: &[Packed]) -> usize {
    items.iter().map(|p| p.tokens).sum()
}

/// Greedy sequential batches, each within `available` tokens.
fn pack_batches(items: Vec<Packed>, available: usize) -> Vec<Vec<Packed>> {
    let mut batches = Vec::new();
    let mut current: Vec<Packed> = Vec::new();
    let mut current_tokens = 0;
    for item in items {
        if current_tokens + item.tokens > available && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += item.tokens;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn fit_prefix(items: Vec<Packed>, available: usize) -> Vec<Packed> {
    let mut used = 0;
    items
        .into_iter()
        .take_while(|p| {
            used += p.tokens;
            used <= available
        })
        .collect()
}

/// The batch items the engine selected, in selection order, deduplicated.
fn picked(response: &ReasoningResponse, batch: &[Packed], already: &[Packed]) -> Vec<Packed> {
    let mut out: Vec<Packed> = Vec::new();
    for selection in &response.selections {
        let Some(item) = batch.iter().find(|p| p.id == selection.document_id) else {
            continue;
        };
        if out.iter().chain(already.iter()).any(|p| p.id == item.id) {
            continue;
        }
        out.push(item.clone());
    }
    out
}

impl ReasoningStrategy {
    pub fn new(
        reasoner: Option<Arc<dyn ReasoningEngine>>,
        budget: Duration,
        context_budget_tokens: usize,
        max_output_tokens: u32,
        shortlist_size: usize,
    ) -> Self {
        Self {
            reasoner,
            budget,
            context_budget_tokens,
            max_output_tokens,
            shortlist_size: shortlist_size.max(1),
        }
    }

    fn request(&self, query: &str, items: &[Packed], mode: ReasoningMode, max_selections: usize) -> ReasoningRequest {
        ReasoningRequest {
            query: query.to_string(),
            candidates: items
                .iter()
                .map(|p| ReasoningCandidate {
                    document_id: p.id.clone(),
                    content: p.content.clone(),
                })
                .collect(),
            max_output_tokens: self.max_output_tokens,
            mode,
            max_selections,
        }
    }

    /// Rank `docs` (in the given order) for `query`, returning at most
    /// `limit` hits.
    pub async fn rank(&self, query: &str, docs: &[&StoredDocument], limit: usize) -> MemoryResult<Ranking> {
        let reasoner = self
            .reasoner
            .as_ref()
            .ok_or_else(|| MemoryError::unavailable("reasoning engine"))?;
        let mut ranking = Ranking::default();
        if docs.is_empty() {
            return Ok(ranking);
        }

        let available = self
            .context_budget_tokens
            .saturating_sub(count_tokens(query))
            .max(1);

        let mut pool: Vec<Packed> = docs
            .iter()
            .map(|d| {
                let content = d.document.content.as_str();
                let tokens = count_tokens(content);
                if tokens > available {
                    ranking.truncated += 1;
                    Packed {
                        id: d.document.id.clone(),
                        content: truncate_tokens(content, available).to_string(),
                        tokens: available,
                    }
                } else {
                    Packed {
                        id: d.document.id.clone(),
                        content: content.to_string(),
                        tokens,
                    }
                }
            })
            .collect();

        while total_tokens(&pool) > available {
            ranking.shortlist_rounds += 1;
            let before = pool.len();
            let mut shortlist: Vec<Packed> = Vec::new();
            for batch in pack_batches(pool, available) {
                let request = self.request(query, &batch, ReasoningMode::Shortlist, self.shortlist_size);
                let response = reasoner.reason(&request).await?;
                ranking.calls += 1;
                let chosen = picked(&response, &batch, &shortlist);
                shortlist.extend(chosen.into_iter().take(self.shortlist_size));
            }
            tracing::debug!(
                round = ranking.shortlist_rounds,
                before,
                after = shortlist.len(),
                "Reasoning shortlist round"
            );
            if shortlist.len() >= before {
                shortlist = fit_prefix(shortlist, available);
            }
            pool = shortlist;
        }

        if pool.is_empty() {
            return Ok(ranking);
        }

        let limit = limit.max(1);
        let request = self.request(query, &pool, ReasoningMode::Final, limit);
        let response = reasoner.reason(&request).await?;
        ranking.calls += 1;
        ranking.rationale = response.rationale.clone();

        let mut selected: Vec<(String, Option<f64>)> = Vec::new();
        for selection in &response.selections {
            if !pool.iter().any(|p| p.id == selection.document_id) {
                continue;
            }
            if selected.iter().any(|(id, _)| *id == selection.document_id) {
                continue;
            }
            selected.push((selection.document_id.clone(), selection.confidence));
        }
        selected.truncate(limit);

        let n = selected.len() as f64;
        ranking.hits = selected
            .into_iter()
            .enumerate()
            .map(|(rank, (id, confidence))| {
                let score = match confidence {
                    Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
                    _ => (n - rank as f64) / n,
                };
                ScoredId::new(id, score)
            })
            .collect();
        Ok(ranking)
    }
}

#[async_trait]
impl StrategyExecutor for ReasoningStrategy {
    fn tier(&self) -> Tier {
        Tier::Reasoning
    }

    fn latency_budget(&self) -> Option<Duration> {
        Some(self.budget)
    }

    async fn retrieve(&self, query: &StrategyQuery, candidates: &CandidateSet) -> MemoryResult<StrategyResult> {
        let docs: Vec<&StoredDocument> = candidates.iter().collect();
        let ranking = self.rank(&query.text, &docs, query.limit).await?;
        Ok(StrategyResult {
            strategy: Tier::Reasoning,
            diagnostics: ranking.diagnostics(),
            hits: ranking.hits,
        })
    }
}
