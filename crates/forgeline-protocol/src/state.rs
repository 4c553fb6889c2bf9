//! Request state machine
//!
//! Request states: QUEUED → COMPILING → TESTING → COMPLETED,
//! with COMPILING/TESTING → FAILED on unrecoverable error,
//! FAILED → QUEUED on retry re-entry, and CANCELLED reachable
//! from any non-terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::FailureDetail;

/// Schema version for persisted transition records
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "forgeline/transition@1";

/// Global sequence counter for ordering transitions within a single process
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Get the next sequence number for ordering
pub fn next_seq() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Check if a state is terminal (no further transitions possible)
pub trait TerminalState {
    fn is_terminal(&self) -> bool;
}

/// Request state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    /// Request is queued, waiting for a worker slot
    Queued,
    /// A compile worker holds a lease and is building
    Compiling,
    /// Artifacts are durable; a test worker is executing them
    Testing,
    /// Pipeline finished; a test report exists (its verdict may be fail)
    Completed,
    /// Unrecoverable failure after exhausting retries
    Failed,
    /// Cancelled by the submitter before completion
    Cancelled,
}

impl TerminalState for RequestState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

impl RequestState {
    /// Check if a transition from this state to target is valid
    pub fn can_transition_to(&self, target: RequestState) -> bool {
        match (self, target) {
            // From QUEUED
            (RequestState::Queued, RequestState::Compiling) => true,
            (RequestState::Queued, RequestState::Cancelled) => true,
            (RequestState::Queued, RequestState::Failed) => true, // e.g. sources vanished before dispatch

            // From COMPILING
            (RequestState::Compiling, RequestState::Testing) => true,
            (RequestState::Compiling, RequestState::Failed) => true,
            (RequestState::Compiling, RequestState::Cancelled) => true,

            // From TESTING
            (RequestState::Testing, RequestState::Completed) => true,
            (RequestState::Testing, RequestState::Failed) => true,
            (RequestState::Testing, RequestState::Cancelled) => true,

            // Retry re-entry: the only backward edge
            (RequestState::Failed, RequestState::Queued) => true,

            // Terminal states otherwise cannot transition
            _ => false,
        }
    }
}

/// A single committed state transition.
///
/// The full ordered list of records for a request is its transition
/// history; replaying the history reconstructs the final state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// State entered by this transition
    pub state: RequestState,

    /// Monotonic sequence counter for ordering
    pub seq: u64,

    /// When the transition committed
    pub at: DateTime<Utc>,

    /// Lease generation that produced this transition (0 for
    /// coordinator-internal transitions such as submission and retry)
    pub lease_generation: u64,

    /// Failure detail, present on FAILED transitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<FailureDetail>,
}

impl TransitionRecord {
    /// Create a record for a transition committing now.
    pub fn new(state: RequestState, lease_generation: u64, detail: Option<FailureDetail>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            state,
            seq: next_seq(),
            at: Utc::now(),
            lease_generation,
            detail,
        }
    }
}

/// Errors for state machine operations
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: RequestState, to: RequestState },

    #[error("empty transition history")]
    EmptyHistory,
}

/// Replay an ordered transition history, validating every edge, and
/// return the final state.
///
/// The first record must enter QUEUED (submission); each subsequent
/// record must be a valid transition from its predecessor. Deterministic:
/// the same history always yields the same result.
pub fn replay(history: &[TransitionRecord]) -> Result<RequestState, StateError> {
    let mut iter = history.iter();
    let first = iter.next().ok_or(StateError::EmptyHistory)?;
    if first.state != RequestState::Queued {
        return Err(StateError::InvalidTransition {
            from: first.state,
            to: first.state,
        });
    }
    let mut current = first.state;
    for record in iter {
        if !current.can_transition_to(record.state) {
            return Err(StateError::InvalidTransition {
                from: current,
                to: record.state,
            });
        }
        current = record.state;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: RequestState) -> TransitionRecord {
        TransitionRecord::new(state, 0, None)
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(RequestState::Queued.can_transition_to(RequestState::Compiling));
        assert!(RequestState::Compiling.can_transition_to(RequestState::Testing));
        assert!(RequestState::Testing.can_transition_to(RequestState::Completed));
    }

    #[test]
    fn test_retry_reentry_is_only_backward_edge() {
        assert!(RequestState::Failed.can_transition_to(RequestState::Queued));
        assert!(!RequestState::Completed.can_transition_to(RequestState::Queued));
        assert!(!RequestState::Testing.can_transition_to(RequestState::Compiling));
        assert!(!RequestState::Compiling.can_transition_to(RequestState::Queued));
    }

    #[test]
    fn test_terminal_states() {
        assert!(RequestState::Completed.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(RequestState::Cancelled.is_terminal());
        assert!(!RequestState::Queued.is_terminal());
        assert!(!RequestState::Compiling.is_terminal());
        assert!(!RequestState::Testing.is_terminal());
    }

    #[test]
    fn test_cancel_from_non_terminal() {
        assert!(RequestState::Queued.can_transition_to(RequestState::Cancelled));
        assert!(RequestState::Compiling.can_transition_to(RequestState::Cancelled));
        assert!(RequestState::Testing.can_transition_to(RequestState::Cancelled));
        assert!(!RequestState::Completed.can_transition_to(RequestState::Cancelled));
        assert!(!RequestState::Cancelled.can_transition_to(RequestState::Cancelled));
    }

    #[test]
    fn test_replay_reconstructs_final_state() {
        let history = vec![
            record(RequestState::Queued),
            record(RequestState::Compiling),
            record(RequestState::Testing),
            record(RequestState::Completed),
        ];
        assert_eq!(replay(&history).unwrap(), RequestState::Completed);
    }

    #[test]
    fn test_replay_with_retry_loop() {
        let history = vec![
            record(RequestState::Queued),
            record(RequestState::Compiling),
            record(RequestState::Failed),
            record(RequestState::Queued),
            record(RequestState::Compiling),
            record(RequestState::Testing),
            record(RequestState::Completed),
        ];
        assert_eq!(replay(&history).unwrap(), RequestState::Completed);
    }

    #[test]
    fn test_replay_rejects_invalid_edge() {
        let history = vec![record(RequestState::Queued), record(RequestState::Completed)];
        assert!(replay(&history).is_err());
    }

    #[test]
    fn test_replay_rejects_empty_history() {
        assert!(matches!(replay(&[]), Err(StateError::EmptyHistory)));
    }

    #[test]
    fn test_replay_requires_queued_start() {
        let history = vec![record(RequestState::Compiling)];
        assert!(replay(&history).is_err());
    }

    #[test]
    fn test_seq_increments() {
        let a = record(RequestState::Queued);
        let b = record(RequestState::Queued);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_serialization_screaming_snake() {
        let json = serde_json::to_string(&RequestState::Compiling).unwrap();
        assert_eq!(json, "\"COMPILING\"");
        let back: RequestState = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(back, RequestState::Cancelled);
    }
}
