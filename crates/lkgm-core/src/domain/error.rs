//! Domain-level error taxonomy for LKGM coordination.

use manifest_ledger::StorageError;

/// LKGM domain errors.
#[derive(Debug, thiserror::Error)]
pub enum LkgmError {
    /// Malformed version string or version file. Not retried.
    #[error("cannot parse version '{input}': {reason}")]
    Parse { input: String, reason: String },

    /// The revision counter of `version` cannot be bumped any further.
    #[error("no revision left after {version}")]
    RevisionExhausted { version: String },

    /// The ledger could not be refreshed. Callers retry within their budget.
    #[error("failed to refresh ledger checkout: {detail}")]
    Refresh { detail: String },

    /// Publishing a candidate lost every push race in the retry budget.
    #[error("failed to publish candidate for {line} after {attempts} attempts: {detail}")]
    GenerateBuildSpec {
        line: String,
        attempts: u32,
        detail: String,
    },

    /// A project in a manifest has no usable remote. Not retried.
    #[error("cannot filter manifest: project '{project}' declares no remote and no default remote exists")]
    Filter { project: String },

    /// Promoting a candidate to the baseline failed. Fatal to the run.
    #[error("failed to promote candidate {version}: {detail}")]
    PromoteCandidate { version: String, detail: String },

    /// The tree is not accepting changes; callers back off and report no work.
    #[error("tree is closed: {detail}")]
    TreeClosed { detail: String },

    /// A CL status change that the lifecycle does not allow.
    #[error("invalid status transition for change {change}: {from} -> {to}")]
    InvalidTransition {
        change: u64,
        from: String,
        to: String,
    },

    /// An operation that needs a current candidate was called without one.
    #[error("no candidate has been created or synced in this run")]
    NoCandidate,

    /// Malformed manifest document.
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// Repository client failure.
    #[error("repository error: {0}")]
    Repository(String),

    /// Patch provider (review system) failure.
    #[error("patch provider error for change {change}: {detail}")]
    PatchProvider { change: u64, detail: String },

    /// Speculative job launch failure.
    #[error("launch error: {0}")]
    Launch(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LkgmError {
    /// Whether the error is a transient ledger condition worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            LkgmError::Refresh { .. } => true,
            LkgmError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether callers should treat this as "no work" rather than a failure.
    pub fn is_no_work(&self) -> bool {
        matches!(self, LkgmError::TreeClosed { .. })
    }
}

/// Result type for LKGM domain operations.
pub type Result<T> = std::result::Result<T, LkgmError>;
