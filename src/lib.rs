//! # Memory Agent
//!
//! A fault-tolerant document memory for autonomous agents.
//!
//! Documents are chunked and stored as versioned objects with a separate
//! metadata index. Retrieval runs one of several strategies (vector
//! similarity, LLM reasoning, a hybrid of both, graph expansion) and falls
//! back down a tier ladder to metadata-only search when engines are slow
//! or unavailable. Every store and retrieve runs as a journaled workflow
//! that can be cancelled, inspected, and resumed after a restart.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐   ┌──────────────┐   ┌────────────────────┐
//!  │ CLI/HTTP │──▶│ Orchestrator │──▶│ StorageCoordinator │──▶ object store + index
//!  └──────────┘   └──────┬───────┘   └────────────────────┘
//!                        │
//!                        ▼
//!          ┌─────────────────────────────┐
//!          │ Strategies + retry/fallback │──▶ reasoning / embedding / graph engines
//!          └─────────────────────────────┘
//! ```
//!
//! Pure logic (chunking, policy, state machines, strategies, aggregation)
//! lives in `memory-agent-core`. This crate holds the I/O adapters and the
//! surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`app`] | Builds an orchestrator from a config |
//! | [`commands`] | CLI command implementations |
//! | [`config`] | TOML configuration parsing |
//! | [`coordinator`] | Versioned persistence across object store and index |
//! | [`db`] | SQLite connection |
//! | [`embedding`] | HTTP embedding engine |
//! | [`graph`] | HTTP graph service client |
//! | [`http`] | Shared HTTP client and error classification |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`migrate`] | Schema migrations |
//! | [`object_store`] | Filesystem and S3 object stores |
//! | [`orchestrator`] | Workflow execution, retries, fallback, resume |
//! | [`reasoning`] | Chat-completions reasoning engine |
//! | [`server`] | HTTP API |
//! | [`sqlite_store`] | SQLite index, journal, and embedding cache |
//! | [`worker`] | Per-resource concurrency limits |

pub mod app;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod embedding;
pub mod graph;
pub mod http;
pub mod logging;
pub mod migrate;
pub mod object_store;
pub mod orchestrator;
pub mod reasoning;
pub mod server;
pub mod sqlite_store;
pub mod worker;
