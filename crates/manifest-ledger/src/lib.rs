//! Manifest-Ledger: versioned storage for LKGM coordination
//!
//! This crate provides the persistence layer shared by every build agent.
//! Candidate manifests, the promoted-baseline pointer, builder statuses and
//! CL statuses all live in one versioned store whose only write primitive is
//! "commit if my base is still the tip".
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: revision-pinned reads and optimistic, fast-forward-only writes.
//!
//! ## Key Components
//!
//! - `LedgerStore`: the versioned key-value capability
//! - `GitLedger`: git-backed implementation (local clone + push)
//! - `fakes::MemoryLedger`: in-memory implementation with failure injection

mod error;
pub mod fakes;
pub mod git_ledger;
pub mod storage_traits;

pub use error::StorageError;
pub use git_ledger::GitLedger;
pub use storage_traits::{
    validate_path, ContentDigest, LedgerCommit, LedgerRevision, LedgerStore, LedgerWrite,
    StorageResult,
};
