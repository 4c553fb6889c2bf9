//! Artifact references.
//!
//! Artifacts are owned exclusively by the store; requests hold references,
//! never bytes. The key is the SHA-256 of the content, so identical
//! content always resolves to the same reference.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::request::RequestId;

/// What kind of output an artifact is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Linkable library output (debug profile)
    Library,
    /// Runnable executable output (release profile)
    Executable,
    /// Captured build or execution log
    Log,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Library => "library",
            ArtifactKind::Executable => "executable",
            ArtifactKind::Log => "log",
        }
    }
}

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// SHA-256 hex digest of the content; the store key
    pub content_sha256: String,

    /// Request that produced the artifact
    pub request_id: RequestId,

    /// Artifact kind
    pub kind: ArtifactKind,

    /// Size in bytes
    pub size: u64,
}

impl ArtifactRef {
    /// Build a reference for the given content.
    pub fn for_content(request_id: RequestId, kind: ArtifactKind, content: &[u8]) -> Self {
        Self {
            content_sha256: content_digest(content),
            request_id,
            kind,
            size: content.len() as u64,
        }
    }
}

/// SHA-256 hex digest of a byte slice.
pub fn content_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_content_same_ref() {
        let id = RequestId::generate();
        let a = ArtifactRef::for_content(id.clone(), ArtifactKind::Library, b"bytes");
        let b = ArtifactRef::for_content(id, ArtifactKind::Library, b"bytes");
        assert_eq!(a, b);
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        let digest = content_digest(b"");
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ArtifactKind::Executable).unwrap();
        assert_eq!(json, "\"executable\"");
    }
}
