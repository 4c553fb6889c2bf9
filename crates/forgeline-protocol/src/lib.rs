//! Shared data model for the forgeline build pipeline.
//!
//! Defines the types that flow between the dispatcher, coordinator, and
//! workers: build requests, the request state machine with its transition
//! history, artifact references, test reports, and the error-code registry.

pub mod artifact;
pub mod error;
pub mod report;
pub mod request;
pub mod state;

pub use artifact::{ArtifactKind, ArtifactRef};
pub use error::{ErrorCode, FailureDetail, FailureStage, ValidationError};
pub use report::{TestReport, Verdict};
pub use request::{BuildRequest, Priority, RequestId, SourceRef, SubmissionDoc};
pub use state::{RequestState, StateError, TerminalState, TransitionRecord};
