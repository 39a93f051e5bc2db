//! Error taxonomy for the engine.
//!
//! Every step of a workflow fails with a [`MemoryError`]. The policy engine
//! ([`crate::policy::decide`]) classifies errors into retry, fallback, defer,
//! or fail. Errors that escape a workflow are converted into a
//! [`WorkflowFailure`], whose message is sanitized before it leaves the
//! process.
//!
//! | Variant | Retried | Typical source |
//! |---------|---------|----------------|
//! | `Validation` | never | malformed content, bad id, bad metadata |
//! | `Transient` | yes | network, 429/5xx, database busy |
//! | `StrategyTimeout` | yes | executor exceeded its latency budget |
//! | `Conflict` | never | stale base version on put |
//! | `Chunking` | never | a line larger than the chunk limit |
//! | `Reconciliation` | next cycle | index repair pass |
//! | `NotFound` | never | unknown or deleted document |
//! | `Unavailable` | never (falls back) | engine not configured |
//! | `Internal` | never | bugs, corrupt stored objects |

use serde::{Deserialize, Serialize};

use crate::models::Tier;

/// Result alias used throughout the engine.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors produced by engine steps and collaborators.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("strategy {strategy} exceeded its {budget_ms}ms latency budget")]
    StrategyTimeout { strategy: Tier, budget_ms: u64 },

    #[error("version conflict on document {document_id}: expected base version {expected}, found {found}")]
    Conflict {
        document_id: String,
        expected: u64,
        found: u64,
    },

    #[error("chunking failed: {message}")]
    Chunking { message: String },

    #[error("reconciliation failed: {message}")]
    Reconciliation { message: String },

    #[error("document not found: {document_id}")]
    NotFound { document_id: String },

    #[error("{component} is not configured")]
    Unavailable { component: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl MemoryError {
    pub fn validation(message: impl Into<String>) -> Self {
        MemoryError::Validation {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        MemoryError::Transient {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        MemoryError::Internal {
            message: message.into(),
        }
    }

    pub fn not_found(document_id: impl Into<String>) -> Self {
        MemoryError::NotFound {
            document_id: document_id.into(),
        }
    }

    pub fn unavailable(component: impl Into<String>) -> Self {
        MemoryError::Unavailable {
            component: component.into(),
        }
    }

    /// The serialisable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::Validation { .. } => ErrorKind::Validation,
            MemoryError::Transient { .. } => ErrorKind::Transient,
            MemoryError::StrategyTimeout { .. } => ErrorKind::StrategyTimeout,
            MemoryError::Conflict { .. } => ErrorKind::Conflict,
            MemoryError::Chunking { .. } => ErrorKind::Chunking,
            MemoryError::Reconciliation { .. } => ErrorKind::Reconciliation,
            MemoryError::NotFound { .. } => ErrorKind::NotFound,
            MemoryError::Unavailable { .. } => ErrorKind::Unavailable,
            MemoryError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether another attempt of the same step may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemoryError::Transient { .. } | MemoryError::StrategyTimeout { .. }
        )
    }

    /// A message safe to return to callers.
    ///
    /// Validation, conflict, and not-found messages describe the caller's
    /// own input and are returned verbatim. Everything else is replaced by
    /// a generic description of the kind; the raw error is only logged.
    pub fn sanitized_message(&self) -> String {
        match self {
            MemoryError::Validation { .. }
            | MemoryError::Conflict { .. }
            | MemoryError::NotFound { .. }
            | MemoryError::Chunking { .. } => self.to_string(),
            MemoryError::Transient { .. } => {
                "a dependency failed repeatedly; retries were exhausted".to_string()
            }
            MemoryError::StrategyTimeout { strategy, .. } => {
                format!("strategy {strategy} exceeded its latency budget")
            }
            MemoryError::Reconciliation { .. } => "index reconciliation failed".to_string(),
            MemoryError::Unavailable { component } => format!("{component} is not configured"),
            MemoryError::Internal { .. } => "internal error".to_string(),
        }
    }
}

/// Error kinds as they appear in persisted failures and API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Transient,
    StrategyTimeout,
    Conflict,
    Chunking,
    Reconciliation,
    NotFound,
    Unavailable,
    Internal,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::StrategyTimeout => "strategy_timeout",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Chunking => "chunking",
            ErrorKind::Reconciliation => "reconciliation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a workflow, as persisted and surfaced to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    pub kind: ErrorKind,
    /// The step that escalated the error (e.g. `"persist"`, `"strategy:hybrid"`).
    pub step: String,
    /// Sanitized, caller-safe description.
    pub message: String,
}

impl WorkflowFailure {
    pub fn from_error(step: impl Into<String>, err: &MemoryError) -> Self {
        Self {
            kind: err.kind(),
            step: step.into(),
            message: err.sanitized_message(),
        }
    }

    pub fn cancelled(step: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            step: step.into(),
            message: "workflow was cancelled".to_string(),
        }
    }
}

impl std::fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at step {}: {}", self.kind, self.step, self.message)
    }
}

impl std::error::Error for WorkflowFailure {}
