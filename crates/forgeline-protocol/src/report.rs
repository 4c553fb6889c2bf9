//! Test reports.
//!
//! A report is tied 1:1 to the compile artifact it exercised and is
//! immutable once written. A failing verdict is a reported outcome, not
//! a pipeline failure.

use serde::{Deserialize, Serialize};

use crate::request::RequestId;

/// Schema version for persisted reports
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "forgeline/report@1";

/// Test verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Result of executing a request's test driver against its artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Request the report belongs to
    pub request_id: RequestId,

    /// SHA-256 key of the artifact that was executed
    pub artifact_sha256: String,

    /// Pass/fail verdict
    pub verdict: Verdict,

    /// Captured output of the test run
    pub output: String,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl TestReport {
    /// Create a report for an executed artifact.
    pub fn new(
        request_id: RequestId,
        artifact_sha256: impl Into<String>,
        verdict: Verdict,
        output: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            request_id,
            artifact_sha256: artifact_sha256.into(),
            verdict,
            output: output.into(),
            duration_ms,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}
