//! Error Code Registry
//!
//! Defines the standard error codes surfaced by the pipeline, the
//! validation errors raised at the dispatch boundary, and the failure
//! detail attached to FAILED transitions.

use serde::{Deserialize, Serialize};

/// Standard error codes for pipeline outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed submission, rejected before enqueue; never retried
    ValidationError,
    /// Artifact store I/O failed; transient, retried with backoff
    StorageUnavailable,
    /// Toolchain reported a compilation failure; retried up to policy limit
    CompileError,
    /// Test execution crashed or timed out; same retry policy as compile
    ExecutionError,
    /// Internal fencing signal: a stale lease tried to commit
    LeaseExpired,
    /// Status or cancel query for an unknown request ID
    RequestMissing,
}

impl ErrorCode {
    /// Returns the string representation of the error code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorCode::CompileError => "COMPILE_ERROR",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::LeaseExpired => "LEASE_EXPIRED",
            ErrorCode::RequestMissing => "REQUEST_MISSING",
        }
    }

    /// Whether a failure carrying this code may be retried by policy
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::StorageUnavailable | ErrorCode::CompileError | ErrorCode::ExecutionError
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline stage in which a failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Compile,
    Test,
    Store,
}

/// Detail recorded on a FAILED transition and surfaced verbatim to the
/// submitter on status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Stage that produced the failure
    pub stage: FailureStage,

    /// Error code from the registry
    pub code: ErrorCode,

    /// Human-readable, single-line message; toolchain output is carried
    /// verbatim, never rewritten
    pub message: String,
}

impl FailureDetail {
    /// Create a new failure detail
    pub fn new(stage: FailureStage, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            stage,
            code,
            message: message.into(),
        }
    }
}

/// Submission validation errors, raised by the dispatcher before a
/// request ever touches the queue.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("source list is empty")]
    EmptySources,

    #[error("unknown configuration profile: {0}")]
    UnknownProfile(String),

    #[error("missing test driver reference")]
    MissingTestDriver,

    #[error("originator must not be empty")]
    EmptyOriginator,
}

impl ValidationError {
    /// All validation errors map to the same registry code
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ValidationError
    }
}
