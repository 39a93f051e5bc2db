use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use memory_agent_core::chunk::DEFAULT_MAX_TOKENS_PER_CHUNK;
use memory_agent_core::models::{RequestedStrategy, DEFAULT_SEARCH_LIMIT};
use memory_agent_core::policy::RetryPolicy;
use memory_agent_core::strategy::{LatencyBudgets, StrategySettings};

use crate::coordinator::CacheSettings;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "./config/mem.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreConfig {
    /// `fs` or `s3`.
    #[serde(default = "default_object_store_kind")]
    pub kind: String,
    #[serde(default = "default_object_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            kind: default_object_store_kind(),
            root: default_object_root(),
            bucket: None,
            prefix: String::new(),
            region: default_region(),
            endpoint_url: None,
        }
    }
}

fn default_object_store_kind() -> String {
    "fs".to_string()
}
fn default_object_root() -> PathBuf {
    PathBuf::from("./data/objects")
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens_per_chunk")]
    pub max_tokens_per_chunk: usize,
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_chunk: default_max_tokens_per_chunk(),
            max_document_bytes: default_max_document_bytes(),
        }
    }
}

fn default_max_tokens_per_chunk() -> usize {
    DEFAULT_MAX_TOKENS_PER_CHUNK
}
fn default_max_document_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub default_strategy: RequestedStrategy,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Upper bound on documents fetched from the index per search.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_hybrid_vector_k")]
    pub hybrid_vector_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_strategy: RequestedStrategy::Auto,
            similarity_threshold: default_similarity_threshold(),
            limit: default_limit(),
            max_candidates: default_max_candidates(),
            hybrid_vector_k: default_hybrid_vector_k(),
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.7
}
fn default_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}
fn default_max_candidates() -> usize {
    500
}
fn default_hybrid_vector_k() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReasoningConfig {
    /// `disabled` or `openai` (any OpenAI-compatible chat endpoint).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_openai_url")]
    pub url: String,
    #[serde(default = "default_context_budget_tokens")]
    pub context_budget_tokens: usize,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_shortlist_size")]
    pub shortlist_size: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: default_openai_url(),
            context_budget_tokens: default_context_budget_tokens(),
            max_output_tokens: default_max_output_tokens(),
            shortlist_size: default_shortlist_size(),
        }
    }
}

impl ReasoningConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_context_budget_tokens() -> usize {
    12_000
}
fn default_max_output_tokens() -> u32 {
    1_024
}
fn default_shortlist_size() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `openai`, or `ollama`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL override. Defaults per provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    /// Graph service base URL; absent means no graph service.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_graph_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_graph_max_seeds")]
    pub max_seeds: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_depth: default_graph_max_depth(),
            max_seeds: default_graph_max_seeds(),
        }
    }
}

fn default_graph_max_depth() -> u32 {
    3
}
fn default_graph_max_seeds() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff_ms: self.initial_backoff_ms,
            multiplier: self.multiplier,
            max_backoff_ms: self.max_backoff_ms,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

/// Latency budgets, in milliseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutsConfig {
    #[serde(default = "default_vector_ms")]
    pub vector_ms: u64,
    #[serde(default = "default_reasoning_ms")]
    pub reasoning_ms: u64,
    #[serde(default = "default_hybrid_ms")]
    pub hybrid_ms: u64,
    #[serde(default = "default_graph_rag_ms")]
    pub graph_rag_ms: u64,
    /// Per-call budget for object store and index operations.
    #[serde(default = "default_storage_ms")]
    pub storage_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            vector_ms: default_vector_ms(),
            reasoning_ms: default_reasoning_ms(),
            hybrid_ms: default_hybrid_ms(),
            graph_rag_ms: default_graph_rag_ms(),
            storage_ms: default_storage_ms(),
        }
    }
}

impl TimeoutsConfig {
    pub fn budgets(&self) -> LatencyBudgets {
        LatencyBudgets {
            vector: Duration::from_millis(self.vector_ms),
            reasoning: Duration::from_millis(self.reasoning_ms),
            hybrid: Duration::from_millis(self.hybrid_ms),
            graph_rag: Duration::from_millis(self.graph_rag_ms),
        }
    }

    pub fn storage(&self) -> Duration {
        Duration::from_millis(self.storage_ms)
    }
}

fn default_vector_ms() -> u64 {
    2_000
}
fn default_reasoning_ms() -> u64 {
    30_000
}
fn default_hybrid_ms() -> u64 {
    35_000
}
fn default_graph_rag_ms() -> u64 {
    40_000
}
fn default_storage_ms() -> u64 {
    10_000
}

/// Concurrency limit per kind of work.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    #[serde(default = "default_reasoning_workers")]
    pub reasoning: usize,
    #[serde(default = "default_embedding_workers")]
    pub embedding: usize,
    #[serde(default = "default_graph_workers")]
    pub graph: usize,
    #[serde(default = "default_io_workers")]
    pub object_store: usize,
    #[serde(default = "default_io_workers")]
    pub index: usize,
    #[serde(default = "default_chunking_workers")]
    pub chunking: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            reasoning: default_reasoning_workers(),
            embedding: default_embedding_workers(),
            graph: default_graph_workers(),
            object_store: default_io_workers(),
            index: default_io_workers(),
            chunking: default_chunking_workers(),
        }
    }
}

fn default_reasoning_workers() -> usize {
    4
}
fn default_embedding_workers() -> usize {
    8
}
fn default_graph_workers() -> usize {
    4
}
fn default_io_workers() -> usize {
    16
}
fn default_chunking_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
        }
    }
}

fn default_reconcile_interval() -> u64 {
    300
}

/// In-process cache of decoded document revisions.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// `0` disables the cache.
    #[serde(default = "default_cache_entries")]
    pub max_entries: u64,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            max_entries: self.max_entries,
            ttl: Duration::from_secs(self.ttl_secs),
        }
    }
}

fn default_cache_entries() -> u64 {
    1_000
}
fn default_cache_ttl() -> u64 {
    3_600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Executor tuning derived from the retrieval, reasoning, graph, and
    /// timeout sections.
    pub fn strategy_settings(&self) -> StrategySettings {
        StrategySettings {
            budgets: self.timeouts.budgets(),
            context_budget_tokens: self.reasoning.context_budget_tokens,
            max_output_tokens: self.reasoning.max_output_tokens,
            shortlist_size: self.reasoning.shortlist_size,
            hybrid_vector_k: self.retrieval.hybrid_vector_k,
            graph_max_depth: self.graph.max_depth,
            graph_max_seeds: self.graph.max_seeds,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens_per_chunk == 0 {
        anyhow::bail!("chunking.max_tokens_per_chunk must be > 0");
    }
    if config.chunking.max_document_bytes == 0 {
        anyhow::bail!("chunking.max_document_bytes must be > 0");
    }

    if config.retrieval.limit < 1 {
        anyhow::bail!("retrieval.limit must be >= 1");
    }
    if config.retrieval.max_candidates < 1 {
        anyhow::bail!("retrieval.max_candidates must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
    }

    match config.object_store.kind.as_str() {
        "fs" => {}
        "s3" => {
            if config.object_store.bucket.as_deref().unwrap_or("").is_empty() {
                anyhow::bail!("object_store.bucket must be set when kind is 's3'");
            }
        }
        other => anyhow::bail!("Unknown object store kind: '{}'. Must be fs or s3.", other),
    }

    match config.reasoning.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown reasoning provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.reasoning.is_enabled() && config.reasoning.model.is_none() {
        anyhow::bail!(
            "reasoning.model must be specified when provider is '{}'",
            config.reasoning.provider
        );
    }
    if config.reasoning.context_budget_tokens == 0 {
        anyhow::bail!("reasoning.context_budget_tokens must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    if config.retry.max_attempts < 1 {
        anyhow::bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.multiplier < 1.0 {
        anyhow::bail!("retry.multiplier must be >= 1.0");
    }

    let workers = &config.workers;
    if [
        workers.reasoning,
        workers.embedding,
        workers.graph,
        workers.object_store,
        workers.index,
        workers.chunking,
    ]
    .contains(&0)
    {
        anyhow::bail!("workers.* limits must be > 0");
    }

    if config.reconcile.interval_secs == 0 {
        anyhow::bail!("reconcile.interval_secs must be > 0");
    }
    if config.cache.max_entries > 0 && config.cache.ttl_secs == 0 {
        anyhow::bail!("cache.ttl_secs must be > 0 when the cache is enabled");
    }

    Ok(())
}
