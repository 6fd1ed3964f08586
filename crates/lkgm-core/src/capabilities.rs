//! External collaborators the core drives but does not implement.
//!
//! The repository client, the review system and the job launcher are all
//! consumed through these traits and shared as `Arc<dyn _>`. In-memory
//! implementations live in [`crate::fakes`].

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Change, CommitInfo, Manifest, Result, Version};

/// Source-control operations over the multi-repository checkout.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Bring the working checkout up to date with its tracking branches.
    async fn sync(&self) -> Result<()>;

    /// Check every project out at the revision `manifest` pins.
    async fn checkout(&self, manifest: &Manifest) -> Result<()>;

    /// Snapshot the checkout as a manifest pinning the current revisions.
    async fn export_manifest(&self) -> Result<Manifest>;

    /// Base version from the checkout's version file.
    async fn read_version(&self) -> Result<Version>;

    /// Commits reachable from `to` but not from `from` in `project`, newest
    /// first.
    async fn log_since(&self, project: &str, from: &str, to: &str) -> Result<Vec<CommitInfo>>;
}

/// The code-review system.
#[async_trait]
pub trait PatchProvider: Send + Sync {
    /// Changes currently marked ready by `query`.
    async fn query_ready(&self, query: &str) -> Result<Vec<Change>>;

    /// Review numbers `change` declares a dependency on.
    async fn dependencies(&self, change: &Change) -> Result<Vec<u64>>;

    /// Apply `change` to the working checkout; returns the resulting commit.
    async fn apply(&self, change: &Change) -> Result<String>;

    /// Remove the ready marker so the change is not picked up again.
    async fn remove_ready(&self, change: &Change) -> Result<()>;

    /// Post `message` on the change.
    async fn notify(&self, change: &Change, message: &str) -> Result<()>;
}

/// Whether the tree currently accepts changes.
#[async_trait]
pub trait TreeStatus: Send + Sync {
    async fn is_open(&self) -> Result<bool>;
}

/// Handle to a launched speculative job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Starts a speculative build covering exactly the given changes.
#[async_trait]
pub trait TrybotLauncher: Send + Sync {
    async fn launch(&self, changes: &[Change]) -> Result<JobId>;
}
