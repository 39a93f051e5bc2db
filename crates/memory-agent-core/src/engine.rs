//! Reasoning engine and graph service traits.
//!
//! Both are external collaborators: the engine never runs a language model
//! or a graph traversal itself. Adapters live in the app crate; tests use
//! small in-process fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MemoryResult;

/// Whether the engine is narrowing a batch or producing the final ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    Shortlist,
    Final,
}

/// One candidate shown to the reasoning engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningCandidate {
    pub document_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub query: String,
    /// Candidates in presentation order.
    pub candidates: Vec<ReasoningCandidate>,
    pub max_output_tokens: u32,
    pub mode: ReasoningMode,
    /// Upper bound on the number of selections wanted.
    pub max_selections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub document_id: String,
    /// Engine-reported confidence in `[0, 1]`, when it gives one.
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReasoningResponse {
    /// Ordered best first. May mention ids that were not in the request;
    /// callers must ignore those.
    pub selections: Vec<Selection>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// External service that selects relevant documents given a query and a
/// bounded context of candidates.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn reason(&self, request: &ReasoningRequest) -> MemoryResult<ReasoningResponse>;
}

/// A document reachable from the seed entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub document_id: String,
    pub weight: f64,
}

/// Knowledge-graph lookup: seed entity ids (`entity:<name>`) to connected
/// documents.
#[async_trait]
pub trait GraphService: Send + Sync {
    async fn connected(&self, seeds: &[String], max_depth: u32) -> MemoryResult<Vec<GraphEdge>>;
}

/// Which collaborators are configured. Drives `auto` strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub reasoning: bool,
    pub embeddings: bool,
    pub graph: bool,
}
