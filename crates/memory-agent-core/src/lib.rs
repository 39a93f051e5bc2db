//! # Memory Agent Core
//!
//! Pure engine logic for Memory Agent: data models, the line-packing
//! chunker, the retry/fallback policy, strategy executors, the result
//! aggregator, workflow state machines, and the storage traits.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or HTTP
//! dependencies. Collaborators (object store, index, reasoning and
//! embedding engines, graph service) are reached only through the traits
//! in [`store`] and [`engine`]; the `memory-agent` app crate provides the
//! concrete adapters and the runtime that drives the state machines.

pub mod aggregate;
pub mod chunk;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod filter;
pub mod models;
pub mod policy;
pub mod store;
pub mod strategy;
pub mod workflow;

pub use error::{ErrorKind, MemoryError, MemoryResult, WorkflowFailure};
