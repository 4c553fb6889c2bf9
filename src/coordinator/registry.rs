//! Request registry: the authoritative, durable record of every request.
//!
//! All mutation happens through fenced commits. A worker obtains a lease
//! generation when its stage begins; a commit carries that generation and
//! is discarded with `LeaseExpired` if a newer generation has since been
//! issued for the request. Reapplying a transition that already committed
//! under the same generation is a no-op, which makes the at-least-once
//! queue delivery safe.
//!
//! Durability ordering inside a commit: journal append first, then the
//! in-memory record, then the snapshot rewrite. Recovery reconciles the
//! two (journal wins).

use std::collections::HashMap;
use std::sync::RwLock;

use forgeline_protocol::{
    ArtifactRef, BuildRequest, FailureDetail, RequestId, RequestState, SubmissionDoc, TerminalState,
    TestReport, TransitionRecord,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::journal::{Journal, JournalError, StoredRequest};

/// Errors from registry commits.
#[derive(Debug, Error)]
pub enum CommitError {
    /// Fencing: the committing worker's lease generation is no longer
    /// the active one; its result must be discarded.
    #[error("lease expired for request {request_id}: generation {generation} is stale")]
    LeaseExpired { request_id: RequestId, generation: u64 },

    #[error("invalid transition for request {request_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        request_id: RequestId,
        from: RequestState,
        to: RequestState,
    },

    #[error("unknown request {0}")]
    Unknown(RequestId),

    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Whether a commit changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Applied,
    /// The identical transition already committed under this generation.
    NoOp,
}

/// Extra state attached to a committing transition.
#[derive(Debug)]
pub enum CommitOutput {
    None,
    /// Artifacts produced by a successful compile; must already be
    /// durable in the store before this commit is attempted.
    Artifacts(Vec<ArtifactRef>),
    /// Report produced by a completed test run.
    Report(TestReport),
}

/// Outcome of recording a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-enqueued for another attempt; carries the new retry count.
    Retry(u32),
    /// Retries exhausted (or failure not retryable); FAILED is terminal.
    Terminal,
}

#[derive(Debug)]
struct RequestRecord {
    stored: StoredRequest,
    /// Monotone per-request generation source; never reused.
    generation_counter: u64,
    /// Generation currently allowed to commit worker results.
    active_generation: u64,
}

/// Thread-safe request registry backed by the journal.
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<HashMap<String, RequestRecord>>,
    journal: Journal,
}

impl Registry {
    /// Open the registry, loading all durable records.
    pub fn open(journal: Journal) -> Result<Self, JournalError> {
        let mut map = HashMap::new();
        for stored in journal.load_all()? {
            // Resume fencing above anything any pre-restart worker held.
            let max_generation = stored
                .request
                .history
                .iter()
                .map(|t| t.lease_generation)
                .max()
                .unwrap_or(0);
            map.insert(
                stored.request.request_id.as_str().to_string(),
                RequestRecord {
                    stored,
                    generation_counter: max_generation,
                    active_generation: max_generation,
                },
            );
        }
        Ok(Self {
            inner: RwLock::new(map),
            journal,
        })
    }

    /// Accept a validated submission, creating and persisting its record.
    pub fn insert(&self, doc: SubmissionDoc) -> Result<RequestId, JournalError> {
        let request = BuildRequest::from_submission(doc);
        let request_id = request.request_id.clone();
        let stored = StoredRequest {
            request,
            artifacts: Vec::new(),
            report: None,
        };

        self.journal.append(&request_id, &stored.request.history[0])?;
        self.journal.snapshot(&stored)?;

        let mut map = self.inner.write().unwrap();
        map.insert(
            request_id.as_str().to_string(),
            RequestRecord {
                stored,
                generation_counter: 0,
                active_generation: 0,
            },
        );
        Ok(request_id)
    }

    /// Snapshot of a request's durable record.
    pub fn get(&self, request_id: &RequestId) -> Option<StoredRequest> {
        let map = self.inner.read().unwrap();
        map.get(request_id.as_str()).map(|r| r.stored.clone())
    }

    /// All non-terminal requests (startup recovery).
    pub fn recoverable(&self) -> Vec<StoredRequest> {
        let map = self.inner.read().unwrap();
        let mut pending: Vec<StoredRequest> = map
            .values()
            .filter(|r| !r.stored.request.state.is_terminal())
            .map(|r| r.stored.clone())
            .collect();
        pending.sort_by(|a, b| a.request.request_id.cmp(&b.request.request_id));
        pending
    }

    /// Issue a fresh lease generation for a stage of this request,
    /// fencing out any earlier holder.
    pub fn begin_lease(&self, request_id: &RequestId) -> Result<u64, CommitError> {
        let mut map = self.inner.write().unwrap();
        let record = map
            .get_mut(request_id.as_str())
            .ok_or_else(|| CommitError::Unknown(request_id.clone()))?;
        record.generation_counter += 1;
        record.active_generation = record.generation_counter;
        Ok(record.active_generation)
    }

    /// Commit a state transition under a lease generation.
    ///
    /// Generation 0 marks coordinator-internal transitions (submission,
    /// retry re-entry, cancellation) that bypass fencing.
    pub fn commit(
        &self,
        request_id: &RequestId,
        generation: u64,
        to_state: RequestState,
        detail: Option<FailureDetail>,
        output: CommitOutput,
    ) -> Result<Commit, CommitError> {
        let mut map = self.inner.write().unwrap();
        let record = map
            .get_mut(request_id.as_str())
            .ok_or_else(|| CommitError::Unknown(request_id.clone()))?;
        let request = &mut record.stored.request;

        // Idempotent reapply of an already-committed transition.
        if generation != 0 {
            if let Some(last) = request.history.last() {
                if last.state == to_state && last.lease_generation == generation {
                    return Ok(Commit::NoOp);
                }
            }
            if generation != record.active_generation {
                warn!(
                    request_id = %request_id,
                    generation,
                    active = record.active_generation,
                    "discarding stale result"
                );
                return Err(CommitError::LeaseExpired {
                    request_id: request_id.clone(),
                    generation,
                });
            }
        }

        if !request.state.can_transition_to(to_state) {
            return Err(CommitError::InvalidTransition {
                request_id: request_id.clone(),
                from: request.state,
                to: to_state,
            });
        }

        let transition = TransitionRecord::new(to_state, generation, detail);
        self.journal.append(request_id, &transition)?;
        request.history.push(transition);
        request.state = to_state;

        match output {
            CommitOutput::None => {}
            CommitOutput::Artifacts(artifacts) => record.stored.artifacts = artifacts,
            CommitOutput::Report(report) => record.stored.report = Some(report),
        }

        self.journal.snapshot(&record.stored)?;
        info!(request_id = %request_id, state = ?to_state, generation, "transition committed");
        Ok(Commit::Applied)
    }

    /// Record a stage failure, re-entering the queue if retries remain.
    ///
    /// FAILED always commits (with the failure detail); while the failure
    /// is retryable and the retry budget has room, the retry count is
    /// incremented and the request re-enters QUEUED.
    pub fn fail(
        &self,
        request_id: &RequestId,
        generation: u64,
        detail: FailureDetail,
        max_retries: u32,
    ) -> Result<FailOutcome, CommitError> {
        let retryable = detail.code.is_retryable();
        self.commit(
            request_id,
            generation,
            RequestState::Failed,
            Some(detail),
            CommitOutput::None,
        )?;

        let mut map = self.inner.write().unwrap();
        let record = map
            .get_mut(request_id.as_str())
            .ok_or_else(|| CommitError::Unknown(request_id.clone()))?;
        let retry_count = record.stored.request.retry_count;

        if !retryable || retry_count + 1 >= max_retries {
            // Budget spent: FAILED stays terminal.
            record.stored.request.retry_count = (retry_count + 1).min(max_retries);
            self.journal.snapshot(&record.stored)?;
            return Ok(FailOutcome::Terminal);
        }

        record.stored.request.retry_count = retry_count + 1;
        let transition = TransitionRecord::new(RequestState::Queued, 0, None);
        self.journal.append(request_id, &transition)?;
        record.stored.request.history.push(transition);
        record.stored.request.state = RequestState::Queued;
        self.journal.snapshot(&record.stored)?;

        Ok(FailOutcome::Retry(record.stored.request.retry_count))
    }

    /// Mark cancellation requested. A QUEUED request cancels immediately;
    /// an in-flight one cancels at the coordinator's next transition
    /// check (lease fencing, not forceful interruption).
    pub fn request_cancel(&self, request_id: &RequestId) -> Result<RequestState, CommitError> {
        {
            let mut map = self.inner.write().unwrap();
            let record = map
                .get_mut(request_id.as_str())
                .ok_or_else(|| CommitError::Unknown(request_id.clone()))?;
            if record.stored.request.state.is_terminal() {
                return Ok(record.stored.request.state);
            }
            record.stored.request.cancel_requested = true;
            self.journal.snapshot(&record.stored)?;
            if record.stored.request.state != RequestState::Queued {
                return Ok(record.stored.request.state);
            }
        }
        self.commit(
            request_id,
            0,
            RequestState::Cancelled,
            None,
            CommitOutput::None,
        )?;
        Ok(RequestState::Cancelled)
    }

    /// Terminal requests older than the retention window.
    pub fn retired(&self, retention: std::time::Duration) -> Vec<RequestId> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let map = self.inner.read().unwrap();
        map.values()
            .filter(|r| r.stored.request.state.is_terminal())
            .filter(|r| {
                r.stored
                    .request
                    .history
                    .last()
                    .map(|t| t.at < cutoff)
                    .unwrap_or(false)
            })
            .map(|r| r.stored.request.request_id.clone())
            .collect()
    }

    /// Drop a retired request from memory and disk.
    pub fn remove(&self, request_id: &RequestId) -> Result<(), JournalError> {
        self.journal.remove(request_id)?;
        let mut map = self.inner.write().unwrap();
        map.remove(request_id.as_str());
        Ok(())
    }
}
