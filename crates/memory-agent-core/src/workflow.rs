//! Workflow state machines and the persisted execution record.
//!
//! Store and retrieve workflows are explicit transition tables: a state and
//! an [`Event`] map to the next state, or to nothing when the transition is
//! illegal. Retries are self-transitions, counted per step on the
//! execution. Because the whole [`WorkflowExecution`] is journaled after
//! every transition, a restarted process can resume from the last recorded
//! state.
//!
//! ```text
//! retrieve:  Received ─► CandidatesFetched ─► StrategyDispatched ─► Aggregating ─► Completed
//!                                                  │      ▲ retry          ▲
//!                                                  ▼      │                │
//!                                             FallbackDispatched ──────────┘
//!
//! store:     Received ─► Validated ─► Chunked ─► Persisted ─► Indexed ─► Completed
//!                                       ▲ retry    ▲ retry  └── deferred ──┘
//! ```
//!
//! Every non-terminal state may move to `Failed`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemoryError, MemoryResult, WorkflowFailure};
use crate::models::{Document, RankedHit, RetrievalRequest, StrategyResult, Tier};
use crate::policy::StepKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieveState {
    Received,
    CandidatesFetched,
    StrategyDispatched,
    FallbackDispatched,
    Aggregating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    Received,
    Validated,
    Chunked,
    Persisted,
    Indexed,
    Completed,
    Failed,
}

/// Inputs to the transition tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    CandidatesFetched,
    StrategyDispatched,
    FallbackDispatched,
    StrategySucceeded,
    Aggregated,
    Validated,
    Chunked,
    Persisted,
    Indexed,
    IndexDeferred,
    Finished,
    RetryScheduled,
    Failed,
}

impl RetrieveState {
    /// The transition table. `None` means the event is illegal here.
    pub fn next(self, event: Event) -> Option<RetrieveState> {
        use RetrieveState::*;
        match (self, event) {
            (Completed | Failed, _) => None,
            (_, Event::Failed) => Some(Failed),
            (Received, Event::RetryScheduled) => Some(Received),
            (Received, Event::CandidatesFetched) => Some(CandidatesFetched),
            (CandidatesFetched, Event::StrategyDispatched) => Some(StrategyDispatched),
            (StrategyDispatched, Event::RetryScheduled) => Some(StrategyDispatched),
            (FallbackDispatched, Event::RetryScheduled) => Some(FallbackDispatched),
            (StrategyDispatched | FallbackDispatched, Event::FallbackDispatched) => {
                Some(FallbackDispatched)
            }
            (StrategyDispatched | FallbackDispatched, Event::StrategySucceeded) => Some(Aggregating),
            (Aggregating, Event::Aggregated) => Some(Completed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RetrieveState::Completed | RetrieveState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetrieveState::Received => "received",
            RetrieveState::CandidatesFetched => "candidates_fetched",
            RetrieveState::StrategyDispatched => "strategy_dispatched",
            RetrieveState::FallbackDispatched => "fallback_dispatched",
            RetrieveState::Aggregating => "aggregating",
            RetrieveState::Completed => "completed",
            RetrieveState::Failed => "failed",
        }
    }
}

impl StoreState {
    /// The transition table. `None` means the event is illegal here.
    pub fn next(self, event: Event) -> Option<StoreState> {
        use StoreState::*;
        match (self, event) {
            (Completed | Failed, _) => None,
            (_, Event::Failed) => Some(Failed),
            (Received, Event::Validated) => Some(Validated),
            (Validated, Event::Chunked) => Some(Chunked),
            (Chunked, Event::RetryScheduled) => Some(Chunked),
            (Chunked, Event::Persisted) => Some(Persisted),
            (Persisted, Event::RetryScheduled) => Some(Persisted),
            (Persisted, Event::Indexed) => Some(Indexed),
            (Persisted, Event::IndexDeferred) => Some(Completed),
            (Indexed, Event::Finished) => Some(Completed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StoreState::Completed | StoreState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StoreState::Received => "received",
            StoreState::Validated => "validated",
            StoreState::Chunked => "chunked",
            StoreState::Persisted => "persisted",
            StoreState::Indexed => "indexed",
            StoreState::Completed => "completed",
            StoreState::Failed => "failed",
        }
    }
}

/// Current state of either machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "machine", content = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    Retrieve(RetrieveState),
    Store(StoreState),
}

impl WorkflowState {
    pub fn next(self, event: Event) -> Option<WorkflowState> {
        match self {
            WorkflowState::Retrieve(s) => s.next(event).map(WorkflowState::Retrieve),
            WorkflowState::Store(s) => s.next(event).map(WorkflowState::Store),
        }
    }

    pub fn is_terminal(self) -> bool {
        match self {
            WorkflowState::Retrieve(s) => s.is_terminal(),
            WorkflowState::Store(s) => s.is_terminal(),
        }
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            WorkflowState::Retrieve(RetrieveState::Failed) | WorkflowState::Store(StoreState::Failed)
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Retrieve(s) => f.write_str(s.as_str()),
            WorkflowState::Store(s) => f.write_str(s.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Store,
    Retrieve,
    Delete,
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkflowKind::Store => "store",
            WorkflowKind::Retrieve => "retrieve",
            WorkflowKind::Delete => "delete",
        })
    }
}

/// The immutable input a workflow was started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowInput {
    /// Store `document`; its `version` is the caller's base version.
    Store { document: Document },
    Retrieve { request: RetrievalRequest },
    /// Soft-delete: stored as a tombstone revision through the store machine.
    Delete { document_id: String, base_version: u64 },
}

/// Result of a completed store or delete workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreReceipt {
    pub document_id: String,
    pub version: u64,
    pub chunk_count: usize,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowOutput {
    Stored(StoreReceipt),
    Retrieved { hits: Vec<RankedHit> },
}

/// One entry in an execution's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub event: Event,
    pub state: WorkflowState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A persisted workflow run: state, history, and partial results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub kind: WorkflowKind,
    pub state: WorkflowState,
    pub input: WorkflowInput,
    #[serde(default)]
    pub history: Vec<StepRecord>,
    /// Strategy results gathered so far, primary first.
    #[serde(default)]
    pub partial_results: Vec<StrategyResult>,
    /// Attempts made per step, keyed by the step's display name.
    #[serde(default)]
    pub retries: BTreeMap<String, u32>,
    #[serde(default)]
    pub current_tier: Option<Tier>,
    #[serde(default)]
    pub attempted_tiers: Vec<Tier>,
    #[serde(default)]
    pub candidate_ids: Vec<String>,
    #[serde(default)]
    pub output: Option<WorkflowOutput>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub failure: Option<WorkflowFailure>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    fn new(kind: WorkflowKind, state: WorkflowState, input: WorkflowInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            state,
            input,
            history: Vec::new(),
            partial_results: Vec::new(),
            retries: BTreeMap::new(),
            current_tier: None,
            attempted_tiers: Vec::new(),
            candidate_ids: Vec::new(),
            output: None,
            warnings: Vec::new(),
            failure: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_store(document: Document) -> Self {
        Self::new(
            WorkflowKind::Store,
            WorkflowState::Store(StoreState::Received),
            WorkflowInput::Store { document },
        )
    }

    pub fn new_delete(document_id: impl Into<String>, base_version: u64) -> Self {
        Self::new(
            WorkflowKind::Delete,
            WorkflowState::Store(StoreState::Received),
            WorkflowInput::Delete {
                document_id: document_id.into(),
                base_version,
            },
        )
    }

    pub fn new_retrieve(request: RetrievalRequest) -> Self {
        Self::new(
            WorkflowKind::Retrieve,
            WorkflowState::Retrieve(RetrieveState::Received),
            WorkflowInput::Retrieve { request },
        )
    }

    /// Apply `event` through the transition table and record it.
    ///
    /// # Errors
    ///
    /// [`MemoryError::Internal`] if the event is illegal in the current state.
    pub fn advance(&mut self, event: Event, note: Option<String>) -> MemoryResult<WorkflowState> {
        let next = self.state.next(event).ok_or_else(|| {
            MemoryError::internal(format!(
                "illegal transition {:?} from state {} in workflow {}",
                event, self.state, self.id
            ))
        })?;
        let now = Utc::now();
        self.state = next;
        self.updated_at = now;
        self.history.push(StepRecord {
            event,
            state: next,
            at: now,
            note,
        });
        Ok(next)
    }

    /// Count one more attempt of `step` and return the new total.
    pub fn record_attempt(&mut self, step: StepKind) -> u32 {
        let count = self.retries.entry(step.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn attempts(&self, step: StepKind) -> u32 {
        self.retries.get(&step.to_string()).copied().unwrap_or(0)
    }

    /// Move to the failed state with a sanitized failure record.
    pub fn fail(&mut self, failure: WorkflowFailure) -> MemoryResult<()> {
        let note = failure.to_string();
        self.failure = Some(failure);
        self.advance(Event::Failed, Some(note))?;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// The retrieval request, for retrieve workflows.
    pub fn request(&self) -> Option<&RetrievalRequest> {
        match &self.input {
            WorkflowInput::Retrieve { request } => Some(request),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_retrieve_happy_path() {
        let mut exec = WorkflowExecution::new_retrieve(RetrievalRequest::new("q"));
        for event in [
            Event::CandidatesFetched,
            Event::StrategyDispatched,
            Event::RetryScheduled,
            Event::FallbackDispatched,
            Event::StrategySucceeded,
            Event::Aggregated,
        ] {
            exec.advance(event, None).unwrap();
        }
        assert_eq!(exec.state, WorkflowState::Retrieve(RetrieveState::Completed));
        assert_eq!(exec.history.len(), 6);
        assert!(exec.is_finished());
    }

    #[test]
    fn test_illegal_transition_is_internal_error() {
        let mut exec = WorkflowExecution::new_retrieve(RetrievalRequest::new("q"));
        let err = exec.advance(Event::Aggregated, None).unwrap_err();
        assert!(matches!(err, MemoryError::Internal { .. }));
        assert_eq!(exec.state, WorkflowState::Retrieve(RetrieveState::Received));
    }

    #[test]
    fn test_store_deferred_index_completes() {
        assert_eq!(
            StoreState::Persisted.next(Event::IndexDeferred),
            Some(StoreState::Completed)
        );
        assert_eq!(StoreState::Chunked.next(Event::Indexed), None);
        assert_eq!(StoreState::Completed.next(Event::Failed), None);
    }

    #[test]
    fn test_retries_are_self_loops() {
        assert_eq!(
            StoreState::Chunked.next(Event::RetryScheduled),
            Some(StoreState::Chunked)
        );
        assert_eq!(
            RetrieveState::StrategyDispatched.next(Event::RetryScheduled),
            Some(RetrieveState::StrategyDispatched)
        );
        assert_eq!(RetrieveState::Aggregating.next(Event::RetryScheduled), None);
    }

    #[test]
    fn test_any_open_state_can_fail() {
        for state in [
            RetrieveState::Received,
            RetrieveState::CandidatesFetched,
            RetrieveState::StrategyDispatched,
            RetrieveState::FallbackDispatched,
            RetrieveState::Aggregating,
        ] {
            assert_eq!(state.next(Event::Failed), Some(RetrieveState::Failed));
        }
    }

    #[test]
    fn test_fail_records_failure() {
        let mut exec = WorkflowExecution::new_delete("d", 1);
        exec.fail(WorkflowFailure::cancelled("validate")).unwrap();
        assert!(exec.state.is_failed());
        assert_eq!(exec.failure.as_ref().unwrap().kind, ErrorKind::Cancelled);
    }

    #[test]
    fn test_attempt_counters() {
        let mut exec = WorkflowExecution::new_retrieve(RetrievalRequest::new("q"));
        let step = StepKind::Strategy(Tier::Hybrid);
        assert_eq!(exec.record_attempt(step), 1);
        assert_eq!(exec.record_attempt(step), 2);
        assert_eq!(exec.attempts(step), 2);
        assert_eq!(exec.attempts(StepKind::Persist), 0);
    }

    #[test]
    fn test_execution_survives_json_round_trip() {
        let mut exec = WorkflowExecution::new_retrieve(RetrievalRequest::new("deploy"));
        exec.advance(Event::CandidatesFetched, Some("3 candidates".into()))
            .unwrap();
        exec.candidate_ids = vec!["a".into()];
        let json = serde_json::to_string(&exec).unwrap();
        let back: WorkflowExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(back, exec);
        assert_eq!(back.state.to_string(), "candidates_fetched");
    }
}
