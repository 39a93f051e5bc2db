//! Retry and fallback policy.
//!
//! [`decide`] is a pure function from `(step, error, attempt, policy)` to a
//! [`Decision`]. The orchestrator consults it after every failed step and
//! never hard-codes retry behavior of its own.
//!
//! # Rules
//!
//! | Error | Step | Decision |
//! |-------|------|----------|
//! | validation, chunking, conflict, not found | storage steps | `Fail` |
//! | unavailable, or any non-retryable error | strategy | `Fallback` (next tier) immediately |
//! | transient, strategy timeout | any, attempts left | `Retry(backoff)` |
//! | exhausted / non-retryable | strategy | `Fallback`, or `Fail` past the last tier |
//! | exhausted / non-retryable | index, reconcile | `Defer` |
//! | exhausted / non-retryable | other storage steps | `Fail` |
//!
//! # Fallback chain
//!
//! Reasoning, Hybrid, and Graph-RAG all fall back to Vector; Vector falls
//! back to the metadata-only tier; metadata-only has no successor. The
//! metadata-only tier calls no collaborator, takes no worker permit, and
//! has no latency budget, so it cannot fail and every retrieval terminates.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::models::Tier;

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per step, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(base.min(self.max_backoff_ms as f64) as u64)
    }
}

/// A unit of work within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    FetchCandidates,
    Strategy(Tier),
    Validate,
    Chunk,
    Persist,
    Index,
    Reconcile,
    Get,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::FetchCandidates => f.write_str("fetch_candidates"),
            StepKind::Strategy(tier) => write!(f, "strategy:{tier}"),
            StepKind::Validate => f.write_str("validate"),
            StepKind::Chunk => f.write_str("chunk"),
            StepKind::Persist => f.write_str("persist"),
            StepKind::Index => f.write_str("index"),
            StepKind::Reconcile => f.write_str("reconcile"),
            StepKind::Get => f.write_str("get"),
        }
    }
}

/// What to do after a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the same step again after the delay.
    Retry(Duration),
    /// Dispatch the given tier instead.
    Fallback(Tier),
    /// Complete without this step; the reconciliation pass repairs it.
    Defer,
    /// Escalate to the workflow's failed state.
    Fail,
}

/// The next tier in the fallback chain.
pub fn fallback_tier(tier: Tier) -> Option<Tier> {
    match tier {
        Tier::Reasoning | Tier::Hybrid | Tier::GraphRag => Some(Tier::Vector),
        Tier::Vector => Some(Tier::MetadataOnly),
        Tier::MetadataOnly => None,
    }
}

/// Decide how to handle `error` from the `attempt`-th run (1-based) of `step`.
pub fn decide(step: StepKind, error: &MemoryError, attempt: u32, policy: &RetryPolicy) -> Decision {
    let retry = error.is_retryable() && attempt < policy.max_attempts;

    // Every strategy failure ends in a fallback until metadata-only has run.
    if let StepKind::Strategy(tier) = step {
        if retry {
            return Decision::Retry(policy.backoff(attempt));
        }
        return fallback_or_fail(tier);
    }

    if matches!(
        error,
        MemoryError::Validation { .. }
            | MemoryError::Chunking { .. }
            | MemoryError::Conflict { .. }
            | MemoryError::NotFound { .. }
    ) {
        return Decision::Fail;
    }

    if retry {
        return Decision::Retry(policy.backoff(attempt));
    }

    match step {
        StepKind::Index | StepKind::Reconcile => Decision::Defer,
        _ => Decision::Fail,
    }
}

fn fallback_or_fail(tier: Tier) -> Decision {
    match fallback_tier(tier) {
        Some(next) => Decision::Fallback(next),
        None => Decision::Fail,
    }
}
