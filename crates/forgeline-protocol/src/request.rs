//! Build request types.
//!
//! A submission document is what the dispatcher accepts from the outside;
//! a build request is the coordinator-owned record it becomes, carrying
//! the state machine and transition history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{RequestState, TransitionRecord};

/// Schema version for persisted request records
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "forgeline/request@1";

/// Unique, never-reused request identifier.
///
/// ULIDs are lexicographically sortable by creation time, which keeps
/// journal directories naturally ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Assign a fresh request ID.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Wrap an existing identifier (e.g. read back from a journal).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority class for queue ordering. FIFO within a class; higher
/// classes are dequeued first when both are ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Reference to a source file held by the submitter's store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Source identifier (e.g. a path or store key)
    pub name: String,
    /// Source contents; carried inline in this miniature pipeline
    pub content: String,
}

/// Submission document accepted by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionDoc {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Who submitted the request
    pub originator: String,

    /// Ordered list of sources, compiled in sequence
    pub sources: Vec<SourceRef>,

    /// Test driver reference; names the driver executed against the
    /// produced artifact
    pub test_driver: String,

    /// Named configuration profile (e.g. "debug", "release")
    pub profile: String,

    /// Priority class
    #[serde(default)]
    pub priority: Priority,
}

impl SubmissionDoc {
    /// Create a submission document with current schema markers.
    pub fn new(
        originator: impl Into<String>,
        sources: Vec<SourceRef>,
        test_driver: impl Into<String>,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            originator: originator.into(),
            sources,
            test_driver: test_driver.into(),
            profile: profile.into(),
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A build request as owned and mutated by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Unique request ID, assigned at submission, immutable
    pub request_id: RequestId,

    /// Who submitted the request
    pub originator: String,

    /// Ordered source list
    pub sources: Vec<SourceRef>,

    /// Test driver reference
    pub test_driver: String,

    /// Named configuration profile
    pub profile: String,

    /// Priority class
    pub priority: Priority,

    /// When the request was accepted
    pub submitted_at: DateTime<Utc>,

    /// Current state
    pub state: RequestState,

    /// Compile attempts that have failed so far
    pub retry_count: u32,

    /// Whether cancellation has been requested by the submitter
    pub cancel_requested: bool,

    /// Full ordered transition history
    pub history: Vec<TransitionRecord>,
}

impl BuildRequest {
    /// Create a request from an accepted submission, entering QUEUED.
    pub fn from_submission(doc: SubmissionDoc) -> Self {
        let request_id = RequestId::generate();
        let first = TransitionRecord::new(RequestState::Queued, 0, None);
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            request_id,
            originator: doc.originator,
            sources: doc.sources,
            test_driver: doc.test_driver,
            profile: doc.profile,
            priority: doc.priority,
            submitted_at: Utc::now(),
            state: RequestState::Queued,
            retry_count: 0,
            cancel_requested: false,
            history: vec![first],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn doc() -> SubmissionDoc {
        SubmissionDoc::new(
            "client-1",
            vec![SourceRef {
                name: "app.src".to_string(),
                content: "fn main()".to_string(),
            }],
            "driver-1",
            "debug",
        )
    }

    #[test]
    fn test_request_ids_unique() {
        let ids: HashSet<String> = (0..1000)
            .map(|_| RequestId::generate().as_str().to_string())
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_from_submission_starts_queued() {
        let request = BuildRequest::from_submission(doc());
        assert_eq!(request.state, RequestState::Queued);
        assert_eq!(request.retry_count, 0);
        assert_eq!(request.history.len(), 1);
        assert_eq!(request.history[0].state, RequestState::Queued);
        assert!(!request.cancel_requested);
    }

    #[test]
    fn test_priority_default_is_normal() {
        let json = r#"{
            "schema_version": 1,
            "schema_id": "forgeline/request@1",
            "originator": "client-1",
            "sources": [{"name": "a.src", "content": ""}],
            "test_driver": "driver-1",
            "profile": "debug"
        }"#;
        let parsed: SubmissionDoc = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.priority, Priority::Normal);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_request_round_trip() {
        let request = BuildRequest::from_submission(doc());
        let json = serde_json::to_string(&request).unwrap();
        let back: BuildRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_id, request.request_id);
        assert_eq!(back.state, RequestState::Queued);
        assert_eq!(back.sources, request.sources);
    }
}
