//! Core data models used throughout Memory Agent.
//!
//! These types represent the documents, chunks, index entries, retrieval
//! requests, and strategy results that flow between the coordinator, the
//! strategy executors, and the orchestrator. All of them serialize with
//! serde so they can be persisted in the object store and the workflow
//! journal.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::TOKENIZER_VERSION;
use crate::error::MemoryError;
use crate::filter::MetadataFilter;

/// Default number of results returned by a search.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Content format of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    #[default]
    Markdown,
    Json,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Json => "json",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentFormat {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(DocumentFormat::Markdown),
            "json" => Ok(DocumentFormat::Json),
            other => Err(MemoryError::validation(format!(
                "unknown document format '{other}' (expected markdown or json)"
            ))),
        }
    }
}

/// A metadata value: a scalar or a flat list of scalars.
///
/// Serialized untagged, so metadata reads and writes as plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<MetadataValue>),
}

impl MetadataValue {
    /// Equality with numeric widening (`3 == 3.0`).
    pub fn loosely_equals(&self, other: &MetadataValue) -> bool {
        match (self, other) {
            (MetadataValue::Int(a), MetadataValue::Float(b))
            | (MetadataValue::Float(b), MetadataValue::Int(a)) => (*a as f64) == *b,
            _ => self == other,
        }
    }

    /// List membership for lists, substring match for text.
    pub fn contains(&self, needle: &MetadataValue) -> bool {
        match (self, needle) {
            (MetadataValue::List(items), _) => items.iter().any(|v| v.loosely_equals(needle)),
            (MetadataValue::Text(haystack), MetadataValue::Text(n)) => haystack.contains(n.as_str()),
            _ => false,
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, MetadataValue::List(_))
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Text(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

/// Document metadata, ordered by key.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A stored document.
///
/// `version` starts at 1 for the first stored revision. On input to a put,
/// it carries the *base* version the caller last read (0 for new documents).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub format: DocumentFormat,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    pub token_count: usize,
    pub version: u64,
    #[serde(default)]
    pub is_deleted: bool,
    /// Tokenizer that produced `token_count` and the chunk boundaries.
    pub tokenizer_version: u32,
}

impl Document {
    /// A new, unversioned document with the current tokenizer version.
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        format: DocumentFormat,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            content: content.into(),
            format,
            created_at: now,
            updated_at: now,
            metadata,
            token_count: 0,
            version: 0,
            is_deleted: false,
            tokenizer_version: TOKENIZER_VERSION,
        }
    }
}

/// A token-bounded segment of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub document_id: String,
    /// 0-based, contiguous within a document.
    pub chunk_number: u32,
    pub content: String,
    pub token_count: usize,
    /// SHA-256 of `content`, used as the embedding cache key.
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model_version: Option<String>,
}

/// A document together with its chunks, as persisted in the object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub document: Document,
    pub chunks: Vec<DocumentChunk>,
}

/// Queryable metadata record for one live document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub document_id: String,
    pub version: u64,
    pub format: DocumentFormat,
    pub metadata: Metadata,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: u64,
}

impl IndexEntry {
    /// Build a fresh entry for a document; access statistics start empty.
    pub fn from_document(doc: &Document) -> Self {
        Self {
            document_id: doc.id.clone(),
            version: doc.version,
            format: doc.format,
            metadata: doc.metadata.clone(),
            token_count: doc.token_count,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            last_accessed_at: None,
            access_count: 0,
        }
    }
}

/// Strategy requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedStrategy {
    #[default]
    Auto,
    Vector,
    Reasoning,
    Hybrid,
    GraphRag,
}

impl RequestedStrategy {
    /// The explicit tier, or `None` for `auto`.
    pub fn tier(&self) -> Option<Tier> {
        match self {
            RequestedStrategy::Auto => None,
            RequestedStrategy::Vector => Some(Tier::Vector),
            RequestedStrategy::Reasoning => Some(Tier::Reasoning),
            RequestedStrategy::Hybrid => Some(Tier::Hybrid),
            RequestedStrategy::GraphRag => Some(Tier::GraphRag),
        }
    }
}

impl FromStr for RequestedStrategy {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(RequestedStrategy::Auto),
            "vector" => Ok(RequestedStrategy::Vector),
            "reasoning" | "llm" => Ok(RequestedStrategy::Reasoning),
            "hybrid" => Ok(RequestedStrategy::Hybrid),
            "graph_rag" | "graph-rag" | "graph" => Ok(RequestedStrategy::GraphRag),
            other => Err(MemoryError::validation(format!(
                "unknown strategy '{other}' (expected auto, vector, reasoning, hybrid, or graph_rag)"
            ))),
        }
    }
}

/// A position in the fallback chain: one of the four strategies, or the
/// metadata-only filter at the bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Vector,
    Reasoning,
    Hybrid,
    GraphRag,
    MetadataOnly,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Vector => "vector",
            Tier::Reasoning => "reasoning",
            Tier::Hybrid => "hybrid",
            Tier::GraphRag => "graph_rag",
            Tier::MetadataOnly => "metadata_only",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A search request. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,
    #[serde(default)]
    pub strategy: RequestedStrategy,
    #[serde(default)]
    pub filter: MetadataFilter,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Minimum cosine similarity for vector-bearing strategies.
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
}

fn default_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            strategy: RequestedStrategy::Auto,
            filter: MetadataFilter::All,
            limit: DEFAULT_SEARCH_LIMIT,
            similarity_threshold: None,
        }
    }
}

/// One scored document id inside a strategy result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredId {
    pub document_id: String,
    pub score: f64,
}

impl ScoredId {
    pub fn new(document_id: impl Into<String>, score: f64) -> Self {
        Self {
            document_id: document_id.into(),
            score,
        }
    }
}

/// Output of exactly one executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyResult {
    pub strategy: Tier,
    /// Ordered best first.
    pub hits: Vec<ScoredId>,
    #[serde(default)]
    pub diagnostics: serde_json::Map<String, serde_json::Value>,
}

impl StrategyResult {
    pub fn empty(strategy: Tier) -> Self {
        Self {
            strategy,
            hits: Vec::new(),
            diagnostics: serde_json::Map::new(),
        }
    }
}

/// An aggregated hit: the winning score and the tier that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedHit {
    pub document_id: String,
    pub score: f64,
    pub strategy: Tier,
}

/// A search result returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f64,
    pub strategy: Tier,
}

/// The documents a strategy may rank, in index order.
///
/// Strategies must never return a document outside this set; the
/// aggregator drops any id it does not contain.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    docs: Vec<StoredDocument>,
}

impl CandidateSet {
    pub fn new(docs: Vec<StoredDocument>) -> Self {
        Self { docs }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredDocument> {
        self.docs.iter()
    }

    pub fn get(&self, document_id: &str) -> Option<&StoredDocument> {
        self.docs.iter().find(|d| d.document.id == document_id)
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.get(document_id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.docs.iter().map(|d| d.document.id.clone()).collect()
    }

    /// The documents for `ids`, in the order given, skipping unknown ids.
    pub fn select(&self, ids: &[String]) -> Vec<&StoredDocument> {
        ids.iter().filter_map(|id| self.get(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_value_untagged_json() {
        let meta: Metadata = serde_json::from_str(
            r#"{"team": "infra", "priority": 2, "score": 0.5, "tags": ["a", "b"], "draft": false, "owner": null}"#,
        )
        .unwrap();
        assert_eq!(meta["team"], MetadataValue::Text("infra".into()));
        assert_eq!(meta["priority"], MetadataValue::Int(2));
        assert_eq!(meta["score"], MetadataValue::Float(0.5));
        assert_eq!(meta["draft"], MetadataValue::Bool(false));
        assert_eq!(meta["owner"], MetadataValue::Null);
        assert!(meta["tags"].contains(&MetadataValue::from("b")));
    }

    #[test]
    fn test_loose_numeric_equality() {
        assert!(MetadataValue::Int(3).loosely_equals(&MetadataValue::Float(3.0)));
        assert!(!MetadataValue::Int(3).loosely_equals(&MetadataValue::Text("3".into())));
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("md".parse::<DocumentFormat>().unwrap(), DocumentFormat::Markdown);
        assert_eq!("JSON".parse::<DocumentFormat>().unwrap(), DocumentFormat::Json);
        assert!("pdf".parse::<DocumentFormat>().is_err());
    }

    #[test]
    fn test_strategy_parse_accepts_aliases() {
        assert_eq!("llm".parse::<RequestedStrategy>().unwrap(), RequestedStrategy::Reasoning);
        assert_eq!(
            "graph-rag".parse::<RequestedStrategy>().unwrap(),
            RequestedStrategy::GraphRag
        );
        assert_eq!(RequestedStrategy::Auto.tier(), None);
    }

    #[test]
    fn test_request_defaults() {
        let req: RetrievalRequest = serde_json::from_str(r#"{"query": "deploy"}"#).unwrap();
        assert_eq!(req.strategy, RequestedStrategy::Auto);
        assert_eq!(req.filter, MetadataFilter::All);
        assert_eq!(req.limit, DEFAULT_SEARCH_LIMIT);
        assert_eq!(req.similarity_threshold, None);
    }

    #[test]
    fn test_candidate_select_preserves_order() {
        let docs = ["a", "b", "c"]
            .iter()
            .map(|id| StoredDocument {
                document: Document::new(*id, "x", DocumentFormat::Markdown, Metadata::new()),
                chunks: Vec::new(),
            })
            .collect();
        let set = CandidateSet::new(docs);
        let picked = set.select(&["c".to_string(), "zzz".to_string(), "a".to_string()]);
        let ids: Vec<_> = picked.iter().map(|d| d.document.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }
}
