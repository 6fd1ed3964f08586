//! LKGM Core Library
//!
//! Build-candidate coordination over a shared manifest ledger: candidate
//! publication and promotion, builder status exchange, and the
//! pre-submission transaction launcher.

pub mod builder_status;
pub mod candidate_manager;
pub mod capabilities;
pub mod clock;
pub mod config;
pub mod domain;
pub mod fakes;
pub mod launcher;
pub mod manifest_store;
pub mod metrics;
pub mod obs;
pub mod partition;
pub mod poll;
mod retry;
pub mod sync;
pub mod telemetry;
pub mod validation_pool;

pub use builder_status::{status_path, BuilderStatusMap, BuilderStatusPoller, StatusSummary};
pub use candidate_manager::{BlameEntry, CandidateManager, ManagerPhase, PublishedCandidate};
pub use capabilities::{JobId, PatchProvider, RepositoryClient, TreeStatus, TrybotLauncher};
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{LedgerConfig, LkgmConfig, PollSettings, PresubmitConfig};
pub use domain::{
    BuildLine, BuildStatus, BuilderStatusRecord, Change, ClCategory, ClStatus, ClStatusRecord,
    CommitInfo, DefaultRemote, LkgmError, Manifest, PendingCommit, Project, Remote, Result,
    Version,
};
pub use launcher::{LaunchReport, PreSubmissionLauncher};
pub use manifest_store::{ManifestStore, DEFAULT_BASELINE_PATH};
pub use partition::{
    DependencyStrategy, Partition, ReviewDependencies, StaticDependencies, Transaction,
    TransactionPartitioner,
};
pub use poll::{PollConfig, PollState};
pub use sync::commit_queue_candidate;
pub use validation_pool::{cl_status_path, filter_duplicates, ValidationPool};

/// LKGM version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
