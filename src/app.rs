//! Wiring: builds an [`Orchestrator`] from a [`Config`].
//!
//! | Concern | Adapter |
//! |---------|---------|
//! | object store | [`FsObjectStore`] (`kind = "fs"`) or [`S3ObjectStore`] (`kind = "s3"`) |
//! | index, journal, embedding cache | SQLite via [`crate::sqlite_store`] |
//! | reasoning engine | [`crate::reasoning`], absent when disabled |
//! | embedding engine | [`crate::embedding`], absent when disabled |
//! | graph service | [`crate::graph`], absent without `graph.url` |
//!
//! Engines are wrapped by [`WorkerPool::limit_engines`] before the
//! strategies see them, so `workers.*` bounds every outbound call.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;

use memory_agent_core::embedding::EmbeddingCache;
use memory_agent_core::store::{IndexStore, ObjectStore, WorkflowJournal};
use memory_agent_core::strategy::{Engines, StrategySet};

use crate::config::Config;
use crate::coordinator::{StorageCoordinator, StorageLimits};
use crate::embedding::create_embedder;
use crate::graph::create_graph;
use crate::object_store::{FsObjectStore, S3ObjectStore};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::reasoning::create_reasoner;
use crate::sqlite_store::{SqliteEmbeddingCache, SqliteIndexStore, SqliteJournal};
use crate::worker::WorkerPool;
use crate::{db, migrate};

pub fn create_object_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.object_store.kind.as_str() {
        "fs" => Arc::new(FsObjectStore::new(&config.object_store.root)),
        "s3" => Arc::new(S3ObjectStore::from_config(&config.object_store)?),
        other => bail!("Unknown object_store.kind: {} (expected fs or s3)", other),
    };
    Ok(store)
}

/// Connect to the database (applying migrations) and assemble every
/// component the configuration asks for.
pub async fn build(config: &Config) -> Result<Orchestrator> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let objects = create_object_store(config)?;
    let index: Arc<dyn IndexStore> = Arc::new(SqliteIndexStore::new(pool.clone()));
    let journal: Arc<dyn WorkflowJournal> = Arc::new(SqliteJournal::new(pool.clone()));
    let cache: Arc<dyn EmbeddingCache> = Arc::new(SqliteEmbeddingCache::new(pool));

    let pool = WorkerPool::new(&config.workers);
    let budgets = config.timeouts.budgets();
    let engines = Engines {
        reasoning: create_reasoner(&config.reasoning, budgets.reasoning)?,
        embedding: create_embedder(&config.embedding, budgets.vector)?,
        graph: create_graph(&config.graph, budgets.graph_rag)?,
        cache,
    };
    let engines = pool.limit_engines(engines)?;
    let capabilities = engines.capabilities();
    info!(
        object_store = %config.object_store.kind,
        reasoning = capabilities.reasoning,
        embeddings = capabilities.embeddings,
        graph = capabilities.graph,
        "Memory agent configured"
    );

    let limits = StorageLimits {
        max_tokens_per_chunk: config.chunking.max_tokens_per_chunk,
        max_document_bytes: config.chunking.max_document_bytes,
    };
    let coordinator = Arc::new(
        StorageCoordinator::new(objects, index, limits).with_cache(config.cache.settings()),
    );
    let strategies = StrategySet::new(engines, &config.strategy_settings());

    Ok(Orchestrator::new(
        coordinator,
        strategies,
        pool,
        journal,
        OrchestratorSettings::from_config(config),
    ))
}
