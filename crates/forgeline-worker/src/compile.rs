//! Compile capability contract.
//!
//! The coordinator hands a compile worker the request's sources and
//! profile together with a request-scoped workspace; the worker returns
//! artifact bytes or a structured failure. Toolchain-reported failures
//! (the code does not compile) are distinguished from infrastructure
//! failures (the toolchain itself crashed or timed out); both are
//! retryable by coordinator policy.

use forgeline_protocol::{
    ArtifactKind, ErrorCode, FailureDetail, FailureStage, RequestId, SourceRef,
};
use thiserror::Error;

use crate::workspace::{Workspace, WorkspaceError};

/// Input to one compile invocation.
#[derive(Debug, Clone)]
pub struct CompileInput {
    /// Request being built
    pub request_id: RequestId,
    /// Ordered source list
    pub sources: Vec<SourceRef>,
    /// Named configuration profile
    pub profile: String,
}

/// Output of a successful compile invocation.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    /// Artifact bytes, ready for the store
    pub bytes: Vec<u8>,
    /// Artifact kind, decided by the profile
    pub kind: ArtifactKind,
    /// Captured build log, stored alongside the artifact
    pub build_log: String,
}

/// Why a compile invocation failed.
#[derive(Debug, Error)]
pub enum CompileFailure {
    /// The toolchain ran and reported that the sources do not compile.
    #[error("compile error: {0}")]
    Toolchain(String),

    /// The toolchain itself crashed, timed out, or could not run.
    #[error("toolchain execution failed: {0}")]
    Infra(String),

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

impl CompileFailure {
    /// Registry code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            CompileFailure::Toolchain(_) => ErrorCode::CompileError,
            CompileFailure::Infra(_) | CompileFailure::Workspace(_) => ErrorCode::ExecutionError,
        }
    }

    /// Failure detail for the request's transition history.
    pub fn detail(&self) -> FailureDetail {
        FailureDetail::new(FailureStage::Compile, self.code(), self.to_string())
    }
}

/// A pluggable compile toolchain.
///
/// Implementations must be callable concurrently from multiple worker
/// threads; all file activity stays inside the provided workspace.
pub trait CompileCapability: Send + Sync {
    fn compile(
        &self,
        workspace: &Workspace,
        input: &CompileInput,
    ) -> Result<CompiledArtifact, CompileFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_codes() {
        assert_eq!(
            CompileFailure::Toolchain("bad token".into()).code(),
            ErrorCode::CompileError
        );
        assert_eq!(
            CompileFailure::Infra("spawn failed".into()).code(),
            ErrorCode::ExecutionError
        );
    }

    #[test]
    fn test_detail_carries_message_verbatim() {
        let failure = CompileFailure::Toolchain("app.src:3: unexpected token".into());
        let detail = failure.detail();
        assert_eq!(detail.stage, FailureStage::Compile);
        assert!(detail.message.contains("app.src:3: unexpected token"));
    }
}
