//! Dispatch boundary: submit, status, cancel.
//!
//! The thin edge of the pipeline. Submissions are validated before they
//! touch the queue; a malformed document is rejected outright and leaves
//! no trace. Status queries return a snapshot of the durable record;
//! artifact references and the test report are exposed once the request
//! is terminal.

use std::sync::Arc;

use forgeline_protocol::{
    ArtifactRef, FailureDetail, RequestId, RequestState, SubmissionDoc, TerminalState, TestReport,
    ValidationError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::coordinator::{CommitError, Shared};
use crate::journal::JournalError;

/// Errors surfaced at the dispatch boundary.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown request {0}")]
    RequestMissing(RequestId),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Commit(#[from] CommitError),
}

/// Point-in-time view of a request, as returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub request_id: RequestId,
    pub state: RequestState,
    pub retry_count: u32,
    pub cancel_requested: bool,
    /// Detail of the most recent failure, if any
    pub last_failure: Option<FailureDetail>,
    /// Produced artifacts; populated once the request is terminal
    pub artifacts: Vec<ArtifactRef>,
    /// Test report; populated once the request is terminal
    pub report: Option<TestReport>,
}

/// Handle for submitting requests and querying their progress.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Accept a submission, returning its assigned request ID.
    ///
    /// Validation happens first; a rejected document never reaches the
    /// queue or the journal.
    pub fn submit(&self, doc: SubmissionDoc) -> Result<RequestId, DispatchError> {
        self.validate(&doc)?;
        let priority = doc.priority;
        let request_id = self.shared.registry.insert(doc)?;
        self.shared
            .compile_queue
            .enqueue(request_id.clone(), priority);
        info!(request_id = %request_id, "request accepted");
        Ok(request_id)
    }

    fn validate(&self, doc: &SubmissionDoc) -> Result<(), ValidationError> {
        if doc.sources.is_empty() {
            return Err(ValidationError::EmptySources);
        }
        if doc.originator.trim().is_empty() {
            return Err(ValidationError::EmptyOriginator);
        }
        if doc.test_driver.trim().is_empty() {
            return Err(ValidationError::MissingTestDriver);
        }
        if !self.shared.config.knows_profile(&doc.profile) {
            return Err(ValidationError::UnknownProfile(doc.profile.clone()));
        }
        Ok(())
    }

    /// Snapshot a request's current state.
    pub fn status(&self, request_id: &RequestId) -> Result<StatusSnapshot, DispatchError> {
        let stored = self
            .shared
            .registry
            .get(request_id)
            .ok_or_else(|| DispatchError::RequestMissing(request_id.clone()))?;
        let request = stored.request;
        let terminal = request.state.is_terminal();

        let last_failure = request
            .history
            .iter()
            .rev()
            .find_map(|t| t.detail.clone());

        Ok(StatusSnapshot {
            request_id: request.request_id,
            state: request.state,
            retry_count: request.retry_count,
            cancel_requested: request.cancel_requested,
            last_failure,
            artifacts: if terminal { stored.artifacts } else { Vec::new() },
            report: if terminal { stored.report } else { None },
        })
    }

    /// Request cancellation. Returns the state observed at the time of
    /// the request; in-flight work cancels at the next transition check.
    pub fn cancel(&self, request_id: &RequestId) -> Result<RequestState, DispatchError> {
        match self.shared.registry.request_cancel(request_id) {
            Ok(state) => Ok(state),
            Err(CommitError::Unknown(id)) => Err(DispatchError::RequestMissing(id)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use forgeline_protocol::SourceRef;
    use forgeline_worker::{ScriptedTestDriver, ScriptedToolchain};

    use crate::config::PipelineConfig;
    use crate::coordinator::Coordinator;

    fn pipeline(tmp: &tempfile::TempDir) -> Coordinator {
        let config = PipelineConfig {
            data_root: tmp.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        Coordinator::new(
            config,
            Arc::new(ScriptedToolchain::succeeding()),
            Arc::new(ScriptedTestDriver::passing()),
        )
        .unwrap()
    }

    fn doc() -> SubmissionDoc {
        SubmissionDoc::new(
            "client-1",
            vec![SourceRef {
                name: "a.src".to_string(),
                content: "fn a()".to_string(),
            }],
            "assert-entry-count 1",
            "debug",
        )
    }

    #[test]
    fn test_submit_enqueues() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = pipeline(&tmp);
        let dispatcher = coordinator.dispatcher();

        let id = dispatcher.submit(doc()).unwrap();
        let snapshot = dispatcher.status(&id).unwrap();
        assert_eq!(snapshot.state, RequestState::Queued);
        assert_eq!(snapshot.retry_count, 0);
        assert!(snapshot.artifacts.is_empty());
    }

    #[test]
    fn test_empty_sources_rejected_without_queue_touch() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = pipeline(&tmp);
        let dispatcher = coordinator.dispatcher();

        let mut bad = doc();
        bad.sources.clear();
        let result = dispatcher.submit(bad);
        assert!(matches!(
            result,
            Err(DispatchError::Validation(ValidationError::EmptySources))
        ));
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = pipeline(&tmp);
        let dispatcher = coordinator.dispatcher();

        let mut bad = doc();
        bad.profile = "anycpu".to_string();
        assert!(matches!(
            dispatcher.submit(bad),
            Err(DispatchError::Validation(ValidationError::UnknownProfile(_)))
        ));
    }

    #[test]
    fn test_status_of_unknown_request() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = pipeline(&tmp);
        let dispatcher = coordinator.dispatcher();

        let missing = RequestId::generate();
        assert!(matches!(
            dispatcher.status(&missing),
            Err(DispatchError::RequestMissing(_))
        ));
    }

    #[test]
    fn test_cancel_queued_request() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = pipeline(&tmp);
        let dispatcher = coordinator.dispatcher();

        let id = dispatcher.submit(doc()).unwrap();
        assert_eq!(dispatcher.cancel(&id).unwrap(), RequestState::Cancelled);
        assert_eq!(dispatcher.status(&id).unwrap().state, RequestState::Cancelled);
    }
}
