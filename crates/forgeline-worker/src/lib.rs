//! Compile and test worker capabilities for the forgeline pipeline.
//!
//! The coordinator consumes the two capability traits defined here and
//! never sees a concrete toolchain. Implementations must be safely
//! callable from multiple worker threads concurrently; each invocation
//! operates on an independent working directory scoped to the request ID,
//! so no compile workspace is ever shared across requests.
//!
//! Two implementations ship with the crate:
//! - [`BundleToolchain`] / [`ScriptTestDriver`]: a real, deterministic
//!   local lane that packs validated sources into a tar artifact and runs
//!   assertion scripts against it.
//! - [`ScriptedToolchain`] / [`ScriptedTestDriver`]: failure-injection
//!   doubles for coordinator tests.

pub mod bundle;
pub mod compile;
pub mod scripted;
pub mod workspace;

pub use bundle::{BundleToolchain, ScriptTestDriver};
pub use compile::{CompileCapability, CompileFailure, CompileInput, CompiledArtifact};
pub use scripted::{FailurePlan, ScriptedTestDriver, ScriptedToolchain};
pub use test::{ExecutionFailure, TestCapability, TestInput};
pub use workspace::{Workspace, WorkspaceError, WorkspaceRoot};
