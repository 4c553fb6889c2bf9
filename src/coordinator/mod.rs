//! Coordinator: the state machine driving each request through
//! compile → test → report.
//!
//! Fixed-size compile and test pools each pull from their own stage
//! queue; nothing serializes requests globally, so concurrency is
//! bounded only by pool size and per-request leases. Every result is
//! committed through the registry under the lease generation that
//! produced it; a worker whose lease expired mid-stage has its late
//! result discarded there.
//!
//! Ordering invariant: artifacts reach the store before the
//! COMPILING → TESTING transition commits. A crash between the two
//! re-runs the compile, and the store's idempotent put absorbs the
//! duplicate write.

pub mod registry;
pub mod retry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use forgeline_protocol::{
    ArtifactKind, ArtifactRef, ErrorCode, FailureDetail, FailureStage, RequestId, RequestState,
};
use forgeline_worker::{
    CompileCapability, CompileInput, CompiledArtifact, TestCapability, TestInput, WorkspaceError,
    WorkspaceRoot,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::journal::{Journal, JournalError};
use crate::queue::{LeaseToken, RequestQueue};
use crate::store::{ArtifactStore, StoreError};

pub use registry::{Commit, CommitError, CommitOutput, FailOutcome, Registry};
pub use retry::RetryPolicy;

/// How long a worker blocks on an empty queue before rechecking shutdown.
const DEQUEUE_WAIT: Duration = Duration::from_millis(100);

/// Bounded retry attempts for store access at the call site.
const STORE_ATTEMPTS: u32 = 3;

/// Errors from coordinator construction.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// State shared between the coordinator's pools and the dispatcher.
pub(crate) struct Shared {
    pub(crate) config: PipelineConfig,
    pub(crate) registry: Registry,
    pub(crate) store: ArtifactStore,
    pub(crate) compile_queue: RequestQueue,
    pub(crate) test_queue: RequestQueue,
    compiler: Arc<dyn CompileCapability>,
    tester: Arc<dyn TestCapability>,
    workspaces: WorkspaceRoot,
    retry: RetryPolicy,
    shutdown: AtomicBool,
}

/// The pipeline coordinator. Owns the worker pools.
pub struct Coordinator {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Build a coordinator over durable state, recovering any requests
    /// that were in flight when the previous process stopped.
    pub fn new(
        config: PipelineConfig,
        compiler: Arc<dyn CompileCapability>,
        tester: Arc<dyn TestCapability>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let journal = Journal::open(config.state_root())?;
        let registry = Registry::open(journal)?;
        let store = ArtifactStore::open(config.store_root())?;
        let workspaces = WorkspaceRoot::new(config.workspace_root())?;
        let retry = RetryPolicy::new(config.max_retries, config.backoff_base, config.backoff_cap);

        let shared = Arc::new(Shared {
            config,
            registry,
            store,
            compile_queue: RequestQueue::new(),
            test_queue: RequestQueue::new(),
            compiler,
            tester,
            workspaces,
            retry,
            shutdown: AtomicBool::new(false),
        });

        // Recovery: re-enqueue whatever was in flight. COMPILING means a
        // worker died mid-compile; redelivery handles that the same way
        // as a lease expiry. TESTING already has durable artifacts.
        for stored in shared.registry.recoverable() {
            let request = stored.request;
            info!(request_id = %request.request_id, state = ?request.state, "recovered request");
            match request.state {
                RequestState::Queued | RequestState::Compiling => {
                    shared
                        .compile_queue
                        .enqueue(request.request_id, request.priority);
                }
                RequestState::Testing => {
                    shared
                        .test_queue
                        .enqueue(request.request_id, request.priority);
                }
                _ => {}
            }
        }

        Ok(Self {
            shared,
            handles: Vec::new(),
        })
    }

    /// A dispatch handle for submitting and querying requests.
    pub fn dispatcher(&self) -> crate::dispatcher::Dispatcher {
        crate::dispatcher::Dispatcher::new(self.shared.clone())
    }

    /// Spawn the compile and test pools.
    pub fn start(&mut self) {
        for idx in 0..self.shared.config.compile_pool {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("compile-{}", idx))
                .spawn(move || {
                    while !shared.shutdown.load(Ordering::SeqCst) {
                        step_compile(&shared);
                    }
                })
                .expect("spawn compile worker");
            self.handles.push(handle);
        }
        for idx in 0..self.shared.config.test_pool {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("test-{}", idx))
                .spawn(move || {
                    while !shared.shutdown.load(Ordering::SeqCst) {
                        step_test(&shared);
                    }
                })
                .expect("spawn test worker");
            self.handles.push(handle);
        }
    }

    /// Ask the pools to stop after their current step.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.compile_queue.close();
        self.shared.test_queue.close();
    }

    /// Wait for all pool threads to exit.
    pub fn join(mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Garbage-collect terminal requests past the retention window,
    /// removing their records and artifacts. Returns how many were
    /// retired.
    pub fn sweep_retired(&self) -> Result<usize, CoordinatorError> {
        let retired = self.shared.registry.retired(self.shared.config.retention);
        let count = retired.len();
        for request_id in retired {
            self.shared.store.remove_owned_by(&request_id)?;
            self.shared.registry.remove(&request_id)?;
            info!(request_id = %request_id, "request retired");
        }
        Ok(count)
    }
}

/// One compile-pool iteration: pull, build, persist, commit.
fn step_compile(shared: &Shared) {
    let Some(lease) = shared
        .compile_queue
        .dequeue(shared.config.visibility_timeout, DEQUEUE_WAIT)
    else {
        return;
    };
    let request_id = lease.request_id.clone();

    let Some(stored) = shared.registry.get(&request_id) else {
        ack(&shared.compile_queue, &lease);
        return;
    };
    let request = stored.request;

    // Redelivery of something that already moved on.
    if !matches!(request.state, RequestState::Queued | RequestState::Compiling) {
        ack(&shared.compile_queue, &lease);
        return;
    }

    if request.cancel_requested {
        let _ = shared.registry.commit(
            &request_id,
            0,
            RequestState::Cancelled,
            None,
            CommitOutput::None,
        );
        ack(&shared.compile_queue, &lease);
        return;
    }

    let generation = match shared.registry.begin_lease(&request_id) {
        Ok(generation) => generation,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "lease begin failed");
            ack(&shared.compile_queue, &lease);
            return;
        }
    };

    // Redelivered COMPILING requests skip the dispatch transition; the
    // new generation alone fences out the previous holder.
    if request.state == RequestState::Queued {
        if let Err(e) = shared.registry.commit(
            &request_id,
            generation,
            RequestState::Compiling,
            None,
            CommitOutput::None,
        ) {
            warn!(request_id = %request_id, error = %e, "dispatch commit failed");
            ack(&shared.compile_queue, &lease);
            return;
        }
    }

    let input = CompileInput {
        request_id: request_id.clone(),
        sources: request.sources.clone(),
        profile: request.profile.clone(),
    };
    let workspace = match shared.workspaces.scoped(request_id.as_str(), "compile") {
        Ok(workspace) => workspace,
        Err(e) => {
            let detail = FailureDetail::new(
                FailureStage::Compile,
                ErrorCode::ExecutionError,
                e.to_string(),
            );
            record_failure(shared, &request_id, generation, request.priority, detail);
            ack(&shared.compile_queue, &lease);
            return;
        }
    };

    match shared.compiler.compile(&workspace, &input) {
        Ok(artifact) => {
            // Cancellation short-circuit before the stage transition.
            let cancelled = shared
                .registry
                .get(&request_id)
                .map(|s| s.request.cancel_requested)
                .unwrap_or(false);
            if cancelled {
                let _ = shared.registry.commit(
                    &request_id,
                    generation,
                    RequestState::Cancelled,
                    None,
                    CommitOutput::None,
                );
                ack(&shared.compile_queue, &lease);
                return;
            }

            // Write-then-transition: artifacts must be durable first.
            match persist_outputs(shared, &request_id, &artifact) {
                Ok(refs) => {
                    match shared.registry.commit(
                        &request_id,
                        generation,
                        RequestState::Testing,
                        None,
                        CommitOutput::Artifacts(refs),
                    ) {
                        Ok(Commit::Applied) => {
                            debug!(request_id = %request_id, "compile committed, queueing test");
                            shared.test_queue.enqueue(request_id.clone(), request.priority);
                        }
                        Ok(Commit::NoOp) => {}
                        Err(CommitError::LeaseExpired { .. }) => {
                            info!(request_id = %request_id, generation, "late compile result discarded");
                        }
                        Err(e) => {
                            warn!(request_id = %request_id, error = %e, "compile commit failed");
                        }
                    }
                }
                Err(detail) => {
                    record_failure(shared, &request_id, generation, request.priority, detail);
                }
            }
        }
        Err(failure) => {
            record_failure(shared, &request_id, generation, request.priority, failure.detail());
        }
    }

    ack(&shared.compile_queue, &lease);
}

/// One test-pool iteration: pull, execute, commit the report.
fn step_test(shared: &Shared) {
    let Some(lease) = shared
        .test_queue
        .dequeue(shared.config.visibility_timeout, DEQUEUE_WAIT)
    else {
        return;
    };
    let request_id = lease.request_id.clone();

    let Some(stored) = shared.registry.get(&request_id) else {
        ack(&shared.test_queue, &lease);
        return;
    };
    let request = stored.request;

    if request.state != RequestState::Testing {
        ack(&shared.test_queue, &lease);
        return;
    }

    if request.cancel_requested {
        let _ = shared.registry.commit(
            &request_id,
            0,
            RequestState::Cancelled,
            None,
            CommitOutput::None,
        );
        ack(&shared.test_queue, &lease);
        return;
    }

    let generation = match shared.registry.begin_lease(&request_id) {
        Ok(generation) => generation,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "lease begin failed");
            ack(&shared.test_queue, &lease);
            return;
        }
    };

    let Some(artifact) = primary_artifact(&stored.artifacts) else {
        let detail = FailureDetail::new(
            FailureStage::Test,
            ErrorCode::ExecutionError,
            "no compiled artifact recorded",
        );
        record_failure(shared, &request_id, generation, request.priority, detail);
        ack(&shared.test_queue, &lease);
        return;
    };

    let bytes = match get_with_retry(shared, artifact) {
        Ok(bytes) => bytes,
        Err(detail) => {
            record_failure(shared, &request_id, generation, request.priority, detail);
            ack(&shared.test_queue, &lease);
            return;
        }
    };

    let workspace = match shared.workspaces.scoped(request_id.as_str(), "test") {
        Ok(workspace) => workspace,
        Err(e) => {
            let detail =
                FailureDetail::new(FailureStage::Test, ErrorCode::ExecutionError, e.to_string());
            record_failure(shared, &request_id, generation, request.priority, detail);
            ack(&shared.test_queue, &lease);
            return;
        }
    };

    let input = TestInput {
        request_id: request_id.clone(),
        artifact: artifact.clone(),
        artifact_bytes: bytes,
        test_driver: request.test_driver.clone(),
    };

    match shared.tester.run(&workspace, &input) {
        Ok(report) => {
            let verdict = report.verdict;
            match shared.registry.commit(
                &request_id,
                generation,
                RequestState::Completed,
                None,
                CommitOutput::Report(report),
            ) {
                Ok(Commit::Applied) => {
                    info!(request_id = %request_id, verdict = ?verdict, "request completed");
                }
                Ok(Commit::NoOp) => {}
                Err(CommitError::LeaseExpired { .. }) => {
                    info!(request_id = %request_id, generation, "late test result discarded");
                }
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "test commit failed");
                }
            }
        }
        Err(failure) => {
            record_failure(shared, &request_id, generation, request.priority, failure.detail());
        }
    }

    ack(&shared.test_queue, &lease);
}

/// The compiled bundle (as opposed to its build log).
fn primary_artifact(artifacts: &[ArtifactRef]) -> Option<&ArtifactRef> {
    artifacts.iter().find(|a| a.kind != ArtifactKind::Log)
}

/// Persist the compile outputs (bundle plus build log), retrying
/// transient store failures at the call site.
fn persist_outputs(
    shared: &Shared,
    request_id: &RequestId,
    artifact: &CompiledArtifact,
) -> Result<Vec<ArtifactRef>, FailureDetail> {
    let bundle = put_with_retry(shared, request_id, artifact.kind, &artifact.bytes)?;
    let log = put_with_retry(
        shared,
        request_id,
        ArtifactKind::Log,
        artifact.build_log.as_bytes(),
    )?;
    Ok(vec![bundle, log])
}

fn put_with_retry(
    shared: &Shared,
    request_id: &RequestId,
    kind: ArtifactKind,
    bytes: &[u8],
) -> Result<ArtifactRef, FailureDetail> {
    let mut last = None;
    for attempt in 1..=STORE_ATTEMPTS {
        match shared.store.put(request_id, kind, bytes) {
            Ok(artifact) => return Ok(artifact),
            Err(e) => {
                warn!(request_id = %request_id, attempt, error = %e, "store put failed");
                last = Some(e);
                thread::sleep(shared.retry.base_delay());
            }
        }
    }
    Err(FailureDetail::new(
        FailureStage::Store,
        ErrorCode::StorageUnavailable,
        last.map(|e| e.to_string()).unwrap_or_default(),
    ))
}

fn get_with_retry(shared: &Shared, artifact: &ArtifactRef) -> Result<Vec<u8>, FailureDetail> {
    let mut last = None;
    for attempt in 1..=STORE_ATTEMPTS {
        match shared.store.get(artifact) {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                warn!(key = %artifact.content_sha256, attempt, error = %e, "store get failed");
                last = Some(e);
                thread::sleep(shared.retry.base_delay());
            }
        }
    }
    Err(FailureDetail::new(
        FailureStage::Store,
        ErrorCode::StorageUnavailable,
        last.map(|e| e.to_string()).unwrap_or_default(),
    ))
}

/// Record a stage failure and, if the retry budget allows, schedule the
/// backoff re-entry.
fn record_failure(
    shared: &Shared,
    request_id: &RequestId,
    generation: u64,
    priority: forgeline_protocol::Priority,
    detail: FailureDetail,
) {
    let message = detail.message.clone();
    match shared
        .registry
        .fail(request_id, generation, detail, shared.config.max_retries)
    {
        Ok(FailOutcome::Retry(retry_count)) => {
            let delay = shared.retry.delay(retry_count);
            info!(
                request_id = %request_id,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                "retrying after failure"
            );
            shared
                .compile_queue
                .enqueue_delayed(request_id.clone(), priority, delay);
        }
        Ok(FailOutcome::Terminal) => {
            info!(request_id = %request_id, failure = %message, "request failed terminally");
        }
        Err(CommitError::LeaseExpired { .. }) => {
            info!(request_id = %request_id, generation, "late failure discarded");
        }
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "failure commit failed");
        }
    }
}

fn ack(queue: &RequestQueue, lease: &LeaseToken) {
    // A stale ack just means the lease already expired and the item was
    // redelivered; the registry fencing protects correctness.
    if let Err(e) = queue.acknowledge(lease) {
        debug!(error = %e, "acknowledge after expiry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeline_protocol::{ArtifactKind, RequestId};

    #[test]
    fn test_primary_artifact_skips_logs() {
        let id = RequestId::generate();
        let log = ArtifactRef::for_content(id.clone(), ArtifactKind::Log, b"log");
        let lib = ArtifactRef::for_content(id, ArtifactKind::Library, b"lib");
        assert_eq!(primary_artifact(&[log.clone(), lib.clone()]), Some(&lib));
        assert_eq!(primary_artifact(&[log]), None);
    }
}
