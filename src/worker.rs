//! Bounded worker pool.
//!
//! [`WorkerPool`] holds one semaphore per [`WorkKind`]. Storage calls go
//! through [`WorkerPool::run`], which takes a permit and applies a timeout.
//! Engines are wrapped by [`WorkerPool::limit_engines`] so every outbound
//! reasoning, embedding, or graph call takes a permit of its own kind,
//! whichever strategy makes it. Strategy invocations themselves hold no
//! permit; [`WorkerPool::run_strategy`] only enforces the latency budget.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

use memory_agent_core::embedding::{Embedding, EmbeddingEngine};
use memory_agent_core::engine::{GraphEdge, GraphService, ReasoningEngine, ReasoningRequest, ReasoningResponse};
use memory_agent_core::models::{CandidateSet, StrategyResult};
use memory_agent_core::strategy::{Engines, PartialOutput, StrategyExecutor, StrategyQuery};
use memory_agent_core::{MemoryError, MemoryResult};

use crate::config::WorkersConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    Reasoning,
    Embedding,
    Graph,
    ObjectStore,
    Index,
    Chunking,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Reasoning => "reasoning",
            WorkKind::Embedding => "embedding",
            WorkKind::Graph => "graph",
            WorkKind::ObjectStore => "object_store",
            WorkKind::Index => "index",
            WorkKind::Chunking => "chunking",
        }
    }
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    semaphores: Arc<HashMap<WorkKind, Arc<Semaphore>>>,
}

impl WorkerPool {
    pub fn new(limits: &WorkersConfig) -> Self {
        let semaphores = [
            (WorkKind::Reasoning, limits.reasoning),
            (WorkKind::Embedding, limits.embedding),
            (WorkKind::Graph, limits.graph),
            (WorkKind::ObjectStore, limits.object_store),
            (WorkKind::Index, limits.index),
            (WorkKind::Chunking, limits.chunking),
        ]
        .into_iter()
        .map(|(kind, limit)| (kind, Arc::new(Semaphore::new(limit.max(1)))))
        .collect();
        Self {
            semaphores: Arc::new(semaphores),
        }
    }

    /// Free permits for `kind`, for health reporting.
    pub fn available(&self, kind: WorkKind) -> usize {
        self.semaphores
            .get(&kind)
            .map(|s| s.available_permits())
            .unwrap_or(0)
    }

    fn semaphore(&self, kind: WorkKind) -> MemoryResult<Arc<Semaphore>> {
        self.semaphores
            .get(&kind)
            .cloned()
            .ok_or_else(|| MemoryError::internal(format!("no worker pool for {kind}")))
    }

    async fn limited<T, F>(&self, kind: WorkKind, fut: F) -> MemoryResult<T>
    where
        F: Future<Output = MemoryResult<T>>,
    {
        let semaphore = self.semaphore(kind)?;
        let _permit = acquire(&semaphore, kind).await?;
        fut.await
    }

    /// Wrap each configured engine so its calls draw from the matching pool.
    pub fn limit_engines(&self, engines: Engines) -> MemoryResult<Engines> {
        let reasoning = match engines.reasoning {
            Some(inner) => {
                let limited: Arc<dyn ReasoningEngine> = Arc::new(LimitedReasoner {
                    inner,
                    permits: self.semaphore(WorkKind::Reasoning)?,
                });
                Some(limited)
            }
            None => None,
        };
        let embedding = match engines.embedding {
            Some(inner) => {
                let limited: Arc<dyn EmbeddingEngine> = Arc::new(LimitedEmbedder {
                    inner,
                    permits: self.semaphore(WorkKind::Embedding)?,
                });
                Some(limited)
            }
            None => None,
        };
        let graph = match engines.graph {
            Some(inner) => {
                let limited: Arc<dyn GraphService> = Arc::new(LimitedGraph {
                    inner,
                    permits: self.semaphore(WorkKind::Graph)?,
                });
                Some(limited)
            }
            None => None,
        };
        Ok(Engines {
            reasoning,
            embedding,
            graph,
            cache: engines.cache,
        })
    }

    /// Run `fut` on the `kind` pool within `budget`. Queueing for a permit
    /// counts against the budget. A timeout is reported as transient.
    pub async fn run<T, F>(&self, kind: WorkKind, budget: Duration, fut: F) -> MemoryResult<T>
    where
        F: Future<Output = MemoryResult<T>>,
    {
        match tokio::time::timeout(budget, self.limited(kind, fut)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(pool = %kind, budget_ms = budget.as_millis() as u64, "Worker call timed out");
                Err(MemoryError::transient(format!(
                    "{kind} call exceeded {} ms",
                    budget.as_millis()
                )))
            }
        }
    }

    /// Run one strategy invocation within the executor's latency budget.
    /// Finished stages of a composite strategy land in `partial` even when
    /// the invocation times out.
    pub async fn run_strategy(
        &self,
        executor: &dyn StrategyExecutor,
        query: &StrategyQuery,
        candidates: &CandidateSet,
        partial: &PartialOutput,
    ) -> MemoryResult<StrategyResult> {
        let tier = executor.tier();
        let work = executor.retrieve_staged(query, candidates, partial);
        let Some(budget) = executor.latency_budget() else {
            return work.await;
        };
        match tokio::time::timeout(budget, work).await {
            Ok(result) => result,
            Err(_) => Err(MemoryError::StrategyTimeout {
                strategy: tier,
                budget_ms: budget.as_millis() as u64,
            }),
        }
    }
}

async fn acquire(semaphore: &Semaphore, kind: WorkKind) -> MemoryResult<SemaphorePermit<'_>> {
    semaphore
        .acquire()
        .await
        .map_err(|_| MemoryError::internal(format!("worker pool {kind} closed")))
}

struct LimitedReasoner {
    inner: Arc<dyn ReasoningEngine>,
    permits: Arc<Semaphore>,
}

#[async_trait]
impl ReasoningEngine for LimitedReasoner {
    async fn reason(&self, request: &ReasoningRequest) -> MemoryResult<ReasoningResponse> {
        let _permit = acquire(&self.permits, WorkKind::Reasoning).await?;
        self.inner.reason(request).await
    }
}

struct LimitedEmbedder {
    inner: Arc<dyn EmbeddingEngine>,
    permits: Arc<Semaphore>,
}

#[async_trait]
impl EmbeddingEngine for LimitedEmbedder {
    fn model_version(&self) -> &str {
        self.inner.model_version()
    }

    async fn embed(&self, text: &str) -> MemoryResult<Embedding> {
        let _permit = acquire(&self.permits, WorkKind::Embedding).await?;
        self.inner.embed(text).await
    }
}

struct LimitedGraph {
    inner: Arc<dyn GraphService>,
    permits: Arc<Semaphore>,
}

#[async_trait]
impl GraphService for LimitedGraph {
    async fn connected(&self, seeds: &[String], max_depth: u32) -> MemoryResult<Vec<GraphEdge>> {
        let _permit = acquire(&self.permits, WorkKind::Graph).await?;
        self.inner.connected(seeds, max_depth).await
    }
}
