//! Request-scoped working directories.
//!
//! Every compile or test invocation gets its own directory under the
//! worker root, keyed by request ID and stage. Directories are created
//! fresh before the stage runs and removed when the stage handle drops,
//! so concurrent requests never touch each other's files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors from workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Root directory under which per-request workspaces are created.
#[derive(Debug, Clone)]
pub struct WorkspaceRoot {
    root: PathBuf,
}

impl WorkspaceRoot {
    /// Create a workspace root, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Create a fresh workspace for one stage of one request.
    ///
    /// Any leftover directory from a previous attempt of the same request
    /// and stage is removed first; retries must not see stale outputs.
    pub fn scoped(&self, request_id: &str, stage: &str) -> Result<Workspace, WorkspaceError> {
        let dir = self.root.join(request_id).join(stage);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(Workspace { dir })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

/// One stage's private working directory. Removed on drop.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write a file into the workspace, creating parent dirs as needed.
    pub fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf, WorkspaceError> {
        let path = self.dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // Best effort: a failed cleanup leaves the dir for the next
        // attempt's scoped() to remove.
        let _ = fs::remove_dir_all(&self.dir);
    }
}
