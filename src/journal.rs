//! Durable request records.
//!
//! Each request owns a directory under the state root:
//!
//! ```text
//! <state_root>/<request_id>/journal.jsonl   append-only transition log
//! <state_root>/<request_id>/request.json    snapshot (write-then-rename)
//! ```
//!
//! The journal line is appended before the snapshot is rewritten, so a
//! crash between the two loses no transition: recovery replays the
//! journal and takes the longer history. In-flight requests survive a
//! process restart instead of being silently lost.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use forgeline_protocol::{
    state::{self, TransitionRecord},
    ArtifactRef, BuildRequest, RequestId, StateError, TestReport,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors from journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no record for request {0}")]
    Missing(RequestId),

    #[error("corrupt history for request {request_id}: {source}")]
    CorruptHistory {
        request_id: RequestId,
        source: StateError,
    },
}

/// The durable form of a request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRequest {
    pub request: BuildRequest,
    /// Artifacts committed for this request (populated at Compiling→Testing)
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    /// Test report (populated at Testing→Completed)
    #[serde(default)]
    pub report: Option<TestReport>,
}

/// Append-log plus snapshot persistence for request records.
#[derive(Debug)]
pub struct Journal {
    state_root: PathBuf,
}

impl Journal {
    /// Open (creating if needed) the journal root.
    pub fn open(state_root: impl AsRef<Path>) -> Result<Self, JournalError> {
        let state_root = state_root.as_ref().to_path_buf();
        fs::create_dir_all(&state_root)?;
        Ok(Self { state_root })
    }

    fn request_dir(&self, request_id: &RequestId) -> PathBuf {
        self.state_root.join(request_id.as_str())
    }

    fn journal_path(&self, request_id: &RequestId) -> PathBuf {
        self.request_dir(request_id).join("journal.jsonl")
    }

    fn snapshot_path(&self, request_id: &RequestId) -> PathBuf {
        self.request_dir(request_id).join("request.json")
    }

    /// Append one transition to the request's journal.
    pub fn append(
        &self,
        request_id: &RequestId,
        record: &TransitionRecord,
    ) -> Result<(), JournalError> {
        fs::create_dir_all(self.request_dir(request_id))?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path(request_id))?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Rewrite the request snapshot atomically (write-then-rename).
    pub fn snapshot(&self, stored: &StoredRequest) -> Result<(), JournalError> {
        let request_id = &stored.request.request_id;
        fs::create_dir_all(self.request_dir(request_id))?;
        let path = self.snapshot_path(request_id);
        let temp = path.with_extension("tmp");
        fs::write(&temp, serde_json::to_string_pretty(stored)?)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    /// Load one request's snapshot.
    pub fn load(&self, request_id: &RequestId) -> Result<StoredRequest, JournalError> {
        let path = self.snapshot_path(request_id);
        if !path.exists() {
            return Err(JournalError::Missing(request_id.clone()));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Load one request's full journaled history.
    pub fn load_history(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<TransitionRecord>, JournalError> {
        let path = self.journal_path(request_id);
        if !path.exists() {
            return Err(JournalError::Missing(request_id.clone()));
        }
        let mut records = Vec::new();
        for line in fs::read_to_string(path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }

    /// Load every stored request, reconciling snapshot against journal.
    ///
    /// If the journal carries transitions the snapshot missed (crash
    /// between append and snapshot), the journaled history wins and the
    /// snapshot state is recomputed by replay.
    pub fn load_all(&self) -> Result<Vec<StoredRequest>, JournalError> {
        let mut stored = Vec::new();
        for entry in fs::read_dir(&self.state_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let request_id = RequestId::from_string(entry.file_name().to_string_lossy());
            // A directory with journal lines but no snapshot means the
            // process died inside the very first persist, before the
            // submission was ever acknowledged. There is no snapshot to
            // reconcile against; skip it rather than fail recovery of
            // every healthy record.
            let mut record = match self.load(&request_id) {
                Ok(record) => record,
                Err(JournalError::Missing(_)) => {
                    warn!(request_id = %request_id, "skipping request directory without snapshot");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let journaled = self.load_history(&request_id)?;
            if journaled.len() > record.request.history.len() {
                let final_state =
                    state::replay(&journaled).map_err(|source| JournalError::CorruptHistory {
                        request_id: request_id.clone(),
                        source,
                    })?;
                record.request.history = journaled;
                record.request.state = final_state;
                self.snapshot(&record)?;
            }
            stored.push(record);
        }
        stored.sort_by(|a, b| a.request.request_id.cmp(&b.request.request_id));
        Ok(stored)
    }

    /// Remove a retired request's records entirely.
    pub fn remove(&self, request_id: &RequestId) -> Result<(), JournalError> {
        let dir = self.request_dir(request_id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}
