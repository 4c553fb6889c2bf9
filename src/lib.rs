//! forgeline - build-request dispatch and artifact-pipeline coordinator
//!
//! A miniature distributed build pipeline: a dispatcher accepts build
//! requests, a priority queue leases them to fixed-size compile and test
//! worker pools, and a coordinator drives each request through
//! QUEUED → COMPILING → TESTING → COMPLETED with bounded retries,
//! visibility-timeout leases, and lease fencing for stale results. All
//! artifacts, build logs, and reports live in a content-addressed store;
//! request records and their transition histories are durable across
//! restarts.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod journal;
pub mod queue;
pub mod store;

pub use config::{ConfigError, PipelineConfig};
pub use coordinator::{Coordinator, RetryPolicy};
pub use dispatcher::{Dispatcher, DispatchError, StatusSnapshot};
pub use journal::{Journal, JournalError, StoredRequest};
pub use queue::{LeaseToken, QueueError, RequestQueue};
pub use store::{ArtifactStore, StoreError};
