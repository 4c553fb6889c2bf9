//! Failure-injection worker doubles.
//!
//! Coordinator tests need toolchains whose outcomes are chosen up front:
//! fail the first N compiles, always fail, crash the test runner, or
//! stall to let a lease expire. Attempt counters are shared across
//! clones, so a pool of workers sees one plan.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use forgeline_protocol::{ArtifactKind, TestReport, Verdict};

use crate::compile::{CompileCapability, CompileFailure, CompileInput, CompiledArtifact};
use crate::test::{ExecutionFailure, TestCapability, TestInput};
use crate::workspace::Workspace;

/// Outcome plan for a scripted toolchain.
#[derive(Debug, Clone, Default)]
pub struct FailurePlan {
    /// Fail this many compile attempts with a toolchain error before
    /// succeeding.
    pub fail_compiles: u32,
    /// Every compile attempt fails (retry exhaustion scenarios).
    pub always_fail: bool,
    /// Fail this many compile attempts with an infra error.
    pub infra_failures: u32,
    /// Stall the first compile attempt for this long before returning
    /// (lease expiry scenarios; redelivered attempts run at full speed).
    pub stall_first: Option<Duration>,
}

/// Compile capability with scripted outcomes.
#[derive(Debug, Clone)]
pub struct ScriptedToolchain {
    plan: FailurePlan,
    attempts: Arc<AtomicU32>,
}

impl ScriptedToolchain {
    pub fn new(plan: FailurePlan) -> Self {
        Self {
            plan,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Toolchain that succeeds on every attempt.
    pub fn succeeding() -> Self {
        Self::new(FailurePlan::default())
    }

    /// Total compile attempts observed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl CompileCapability for ScriptedToolchain {
    fn compile(
        &self,
        _workspace: &Workspace,
        input: &CompileInput,
    ) -> Result<CompiledArtifact, CompileFailure> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        if attempt == 0 {
            if let Some(delay) = self.plan.stall_first {
                std::thread::sleep(delay);
            }
        }

        if self.plan.always_fail {
            return Err(CompileFailure::Toolchain(format!(
                "scripted: attempt {} does not compile",
                attempt + 1
            )));
        }
        if attempt < self.plan.infra_failures {
            return Err(CompileFailure::Infra(format!(
                "scripted: toolchain crashed on attempt {}",
                attempt + 1
            )));
        }
        if attempt < self.plan.fail_compiles + self.plan.infra_failures {
            return Err(CompileFailure::Toolchain(format!(
                "scripted: attempt {} does not compile",
                attempt + 1
            )));
        }

        let bytes = format!("bundle:{}:{}", input.request_id, input.profile).into_bytes();
        Ok(CompiledArtifact {
            bytes,
            kind: ArtifactKind::Library,
            build_log: format!("scripted compile of {} sources\n", input.sources.len()),
        })
    }
}

/// Test capability with scripted outcomes.
#[derive(Debug, Clone)]
pub struct ScriptedTestDriver {
    /// Crash this many runs before producing a report.
    crash_runs: u32,
    /// Verdict reported once runs stop crashing.
    verdict: Verdict,
    runs: Arc<AtomicU32>,
}

impl ScriptedTestDriver {
    pub fn new(crash_runs: u32, verdict: Verdict) -> Self {
        Self {
            crash_runs,
            verdict,
            runs: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Driver that always reports a passing verdict.
    pub fn passing() -> Self {
        Self::new(0, Verdict::Pass)
    }

    /// Total test runs observed so far.
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

impl TestCapability for ScriptedTestDriver {
    fn run(&self, _workspace: &Workspace, input: &TestInput) -> Result<TestReport, ExecutionFailure> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        if run < self.crash_runs {
            return Err(ExecutionFailure::Crashed(format!(
                "scripted: runner crashed on run {}",
                run + 1
            )));
        }

        Ok(TestReport::new(
            input.request_id.clone(),
            input.artifact.content_sha256.clone(),
            self.verdict,
            format!("scripted run {}\n", run + 1),
            1,
        ))
    }
}
