//! Storage trait definitions for the manifest ledger
//!
//! The ledger is a versioned key-value store: every successful write produces
//! a new revision, and a write is only accepted when it was prepared against
//! the current tip. That fast-forward rule is the only concurrency control the
//! coordination protocol relies on; writers that lose a race re-read the tip
//! and try again.
//!
//! - `LedgerStore`: read files at a revision, list directories, write-if-fast-forward
//! - `ContentDigest`: SHA-256 identity for stored documents
//!
//! In-memory fakes are provided for testing via the `fakes` module, and a
//! git-backed implementation lives in `git_ledger`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Revisions and writes
// ---------------------------------------------------------------------------

/// Opaque identifier of one ledger revision (a commit id for git backends).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerRevision(pub String);

impl LedgerRevision {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LedgerRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single file to create or overwrite in a ledger commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerWrite {
    pub path: String,
    pub contents: Vec<u8>,
}

impl LedgerWrite {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// A batch of writes applied atomically on top of a base revision.
#[derive(Debug, Clone)]
pub struct LedgerCommit {
    /// Commit message recorded with the new revision
    pub message: String,
    /// Files written by this commit
    pub writes: Vec<LedgerWrite>,
}

impl LedgerCommit {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            writes: Vec::new(),
        }
    }

    pub fn with_write(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.writes.push(LedgerWrite::new(path, contents));
        self
    }
}

/// Reject paths that are empty, absolute, or contain `.`/`..` components.
pub fn validate_path(path: &str) -> StorageResult<()> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.ends_with('/')
        || path
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StorageError::InvalidPath {
            path: path.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// LedgerStore
// ---------------------------------------------------------------------------

/// Shared, append-only, fast-forward-ordered store.
///
/// Guarantees:
/// - `fetch_tip` returns the newest revision visible to the caller.
/// - `read` / `list` at a given revision always return the same answer.
/// - `commit` succeeds only when `base` is the current tip; otherwise it
///   fails with `StorageError::PushRejected` and nothing is written.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Refresh from the remote and return the tip revision.
    async fn fetch_tip(&self) -> StorageResult<LedgerRevision>;

    /// Read a file at `at`. Returns `Ok(None)` when the path does not exist.
    async fn read(&self, at: &LedgerRevision, path: &str) -> StorageResult<Option<Vec<u8>>>;

    /// List file names (not full paths) directly under `dir` at `at`.
    /// A missing directory lists as empty.
    async fn list(&self, at: &LedgerRevision, dir: &str) -> StorageResult<Vec<String>>;

    /// Apply `commit` on top of `base` if `base` is still the tip.
    async fn commit(
        &self,
        base: &LedgerRevision,
        commit: LedgerCommit,
    ) -> StorageResult<LedgerRevision>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_short_form_is_prefix() {
        let a = ContentDigest::from_bytes(b"manifest");
        let b = ContentDigest::from_bytes(b"manifest");
        assert_eq!(a, b);
        assert_eq!(a.short().len(), 12);
        assert!(a.as_str().starts_with(a.short()));
    }

    #[test]
    fn digest_try_from_rejects_non_hex() {
        assert!(ContentDigest::try_from("xyz".to_string()).is_err());
        let good = ContentDigest::from_bytes(b"x").as_str().to_uppercase();
        let parsed = ContentDigest::try_from(good).unwrap();
        assert_eq!(parsed, ContentDigest::from_bytes(b"x"));
    }

    #[test]
    fn validate_path_rules() {
        assert!(validate_path("commit-queue/41.0.0-rc1.xml").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/abs").is_err());
        assert!(validate_path("a/../b").is_err());
        assert!(validate_path("a//b").is_err());
        assert!(validate_path("dir/").is_err());
    }
}
