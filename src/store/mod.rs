//! Content-addressed artifact store.
//!
//! Stores build outputs, logs, and bundles keyed by the SHA-256 of their
//! content, using a two-level fan-out layout:
//! `<store_root>/<sha256[0:2]>/<sha256>/blob` with a `ref.json` sidecar
//! carrying kind, size, and the set of owning requests.
//!
//! Writes go to a temp file and are renamed into place, so concurrent
//! writers of identical content never corrupt each other; the second
//! writer simply discards its copy. `put` is therefore idempotent:
//! identical bytes always resolve to the same key and one stored blob.
//! Identical content from distinct requests shares that blob; each
//! request is recorded as an owner in the sidecar, and the blob is only
//! deleted once the retention sweep has released every owner.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use forgeline_protocol::{ArtifactKind, ArtifactRef, RequestId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Errors from artifact store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient I/O failure; the caller decides whether to retry.
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] io::Error),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("corrupt sidecar for {key}: {reason}")]
    CorruptSidecar { key: String, reason: String },
}

/// Distinguishes this writer's temp files from other processes'.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sidecar metadata for one stored blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    content_sha256: String,
    kind: ArtifactKind,
    size: u64,
    /// Every request that put this content. A blob stays alive until
    /// the last owner is released.
    owners: Vec<RequestId>,
}

/// Content-addressed artifact store.
#[derive(Debug)]
pub struct ArtifactStore {
    store_root: PathBuf,
    /// Serializes sidecar read-modify-write cycles; owner updates from
    /// concurrent puts and sweeps must not lose each other.
    mutate: Mutex<()>,
}

impl ArtifactStore {
    /// Open (creating if needed) a store at the given root.
    pub fn open(store_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store_root = store_root.as_ref().to_path_buf();
        fs::create_dir_all(&store_root)?;
        fs::create_dir_all(store_root.join(".tmp"))?;
        Ok(Self {
            store_root,
            mutate: Mutex::new(()),
        })
    }

    fn blob_dir(&self, sha256: &str) -> PathBuf {
        let prefix = &sha256[..2.min(sha256.len())];
        self.store_root.join(prefix).join(sha256)
    }

    fn blob_path(&self, sha256: &str) -> PathBuf {
        self.blob_dir(sha256).join("blob")
    }

    fn sidecar_path(&self, sha256: &str) -> PathBuf {
        self.blob_dir(sha256).join("ref.json")
    }

    fn temp_path(&self, sha256: &str) -> PathBuf {
        self.store_root.join(".tmp").join(format!(
            "{}.{}.{}",
            sha256,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::SeqCst)
        ))
    }

    fn read_sidecar(&self, sha256: &str) -> Result<Sidecar, StoreError> {
        let text = fs::read_to_string(self.sidecar_path(sha256))?;
        serde_json::from_str(&text).map_err(|e| StoreError::CorruptSidecar {
            key: sha256.to_string(),
            reason: e.to_string(),
        })
    }

    fn write_sidecar(&self, sidecar: &Sidecar) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(sidecar).map_err(|e| {
            StoreError::CorruptSidecar {
                key: sidecar.content_sha256.clone(),
                reason: e.to_string(),
            }
        })?;
        let mut temp = self.temp_path(&sidecar.content_sha256).into_os_string();
        temp.push(".ref");
        let temp = PathBuf::from(temp);
        fs::write(&temp, text)?;
        fs::rename(&temp, self.sidecar_path(&sidecar.content_sha256))?;
        Ok(())
    }

    /// Store content, returning its reference.
    ///
    /// Idempotent: putting identical content twice yields the same
    /// reference and does not duplicate storage. A second request
    /// putting the same content is added as a co-owner of the blob.
    pub fn put(
        &self,
        request_id: &RequestId,
        kind: ArtifactKind,
        content: &[u8],
    ) -> Result<ArtifactRef, StoreError> {
        let artifact = ArtifactRef::for_content(request_id.clone(), kind, content);
        let blob_path = self.blob_path(&artifact.content_sha256);

        let _guard = self.mutate.lock().unwrap();
        if blob_path.exists() {
            let mut sidecar = self.read_sidecar(&artifact.content_sha256)?;
            if !sidecar.owners.contains(request_id) {
                sidecar.owners.push(request_id.clone());
                self.write_sidecar(&sidecar)?;
            }
            debug!(key = %artifact.content_sha256, "put deduplicated");
            return Ok(artifact);
        }

        fs::create_dir_all(self.blob_dir(&artifact.content_sha256))?;

        // Write-then-rename; a concurrent writer of the same content
        // races benignly because both rename identical bytes.
        let temp = self.temp_path(&artifact.content_sha256);
        let mut file = File::create(&temp)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp, &blob_path)?;

        self.write_sidecar(&Sidecar {
            content_sha256: artifact.content_sha256.clone(),
            kind,
            size: artifact.size,
            owners: vec![request_id.clone()],
        })?;

        debug!(key = %artifact.content_sha256, size = artifact.size, kind = kind.as_str(), "artifact stored");
        Ok(artifact)
    }

    /// Fetch an artifact's bytes.
    pub fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(&artifact.content_sha256);
        if !path.exists() {
            return Err(StoreError::NotFound(artifact.content_sha256.clone()));
        }
        Ok(fs::read(path)?)
    }

    /// Whether a key is present.
    pub fn contains(&self, sha256: &str) -> bool {
        self.blob_path(sha256).exists()
    }

    /// List stored references whose key starts with the given prefix,
    /// one per owning request, ordered by key.
    pub fn list(&self, prefix: &str) -> Result<Vec<ArtifactRef>, StoreError> {
        let mut refs = Vec::new();
        for sidecar in self.scan(prefix)? {
            for owner in &sidecar.owners {
                refs.push(ArtifactRef {
                    content_sha256: sidecar.content_sha256.clone(),
                    request_id: owner.clone(),
                    kind: sidecar.kind,
                    size: sidecar.size,
                });
            }
        }
        refs.sort_by(|a, b| {
            a.content_sha256
                .cmp(&b.content_sha256)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        Ok(refs)
    }

    fn scan(&self, prefix: &str) -> Result<Vec<Sidecar>, StoreError> {
        let mut sidecars = Vec::new();
        for entry in WalkDir::new(&self.store_root)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_name() != "ref.json" {
                continue;
            }
            let key = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !key.starts_with(prefix) {
                continue;
            }
            sidecars.push(self.read_sidecar(&key)?);
        }
        Ok(sidecars)
    }

    /// Release a retired request's ownership of its artifacts. A blob is
    /// deleted only when no other live request still owns it. Returns
    /// how many ownerships were released.
    pub fn remove_owned_by(&self, request_id: &RequestId) -> Result<usize, StoreError> {
        let _guard = self.mutate.lock().unwrap();
        let mut released = 0;
        for mut sidecar in self.scan("")? {
            let before = sidecar.owners.len();
            sidecar.owners.retain(|owner| owner != request_id);
            if sidecar.owners.len() == before {
                continue;
            }
            released += 1;
            if sidecar.owners.is_empty() {
                fs::remove_dir_all(self.blob_dir(&sidecar.content_sha256))?;
            } else {
                self.write_sidecar(&sidecar)?;
            }
        }
        debug!(request_id = %request_id, released, "artifact ownerships released");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path().join("store")).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_tmp, store) = store();
        let id = RequestId::generate();
        let artifact = store.put(&id, ArtifactKind::Library, b"bundle bytes").unwrap();
        assert_eq!(store.get(&artifact).unwrap(), b"bundle bytes");
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_tmp, store) = store();
        let id = RequestId::generate();
        let a = store.put(&id, ArtifactKind::Library, b"same").unwrap();
        let b = store.put(&id, ArtifactKind::Library, b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list("").unwrap().len(), 1);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_tmp, store) = store();
        let id = RequestId::generate();
        let artifact = ArtifactRef::for_content(id, ArtifactKind::Log, b"never stored");
        assert!(matches!(store.get(&artifact), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_list_by_prefix() {
        let (_tmp, store) = store();
        let id = RequestId::generate();
        let a = store.put(&id, ArtifactKind::Library, b"one").unwrap();
        store.put(&id, ArtifactKind::Log, b"two").unwrap();

        let hits = store.list(&a.content_sha256[..8]).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0], a);

        let all = store.list("").unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_remove_owned_by_only_touches_owner() {
        let (_tmp, store) = store();
        let mine = RequestId::generate();
        let theirs = RequestId::generate();
        store.put(&mine, ArtifactKind::Library, b"mine").unwrap();
        let kept = store.put(&theirs, ArtifactKind::Library, b"theirs").unwrap();

        let released = store.remove_owned_by(&mine).unwrap();
        assert_eq!(released, 1);
        assert!(store.get(&kept).is_ok());
        assert_eq!(store.list("").unwrap().len(), 1);
    }

    #[test]
    fn test_shared_blob_survives_one_owner_retiring() {
        let (_tmp, store) = store();
        let first = RequestId::generate();
        let second = RequestId::generate();

        // Identical bytes from two requests share one blob.
        let a = store.put(&first, ArtifactKind::Library, b"shared bundle").unwrap();
        let b = store.put(&second, ArtifactKind::Library, b"shared bundle").unwrap();
        assert_eq!(a.content_sha256, b.content_sha256);
        assert_eq!(store.list("").unwrap().len(), 2);

        // Retiring the first owner must not take the blob away from the
        // second, whose reference is still live.
        assert_eq!(store.remove_owned_by(&first).unwrap(), 1);
        assert_eq!(store.get(&b).unwrap(), b"shared bundle");
        assert_eq!(store.list("").unwrap().len(), 1);

        // Releasing the last owner finally deletes the blob.
        assert_eq!(store.remove_owned_by(&second).unwrap(), 1);
        assert!(matches!(store.get(&b), Err(StoreError::NotFound(_))));
        assert!(!store.contains(&b.content_sha256));
    }

    #[test]
    fn test_reput_after_release_restores_ownership() {
        let (_tmp, store) = store();
        let id = RequestId::generate();
        let artifact = store.put(&id, ArtifactKind::Log, b"log line").unwrap();
        store.remove_owned_by(&id).unwrap();
        assert!(!store.contains(&artifact.content_sha256));

        let again = store.put(&id, ArtifactKind::Log, b"log line").unwrap();
        assert_eq!(again, artifact);
        assert_eq!(store.get(&again).unwrap(), b"log line");
    }
}
