//! Domain models for LKGM coordination.
//!
//! Canonical definitions for the core entities:
//! - `Version`: candidate version numbers and their total order
//! - `BuildLine`: independent candidate sequences in the ledger
//! - `Manifest`: pinned multi-repository snapshots
//! - `Change`: change-lists from the review system
//! - `BuilderStatusRecord` / `ClStatusRecord`: ledger-backed status records

pub mod build_line;
pub mod change;
pub mod error;
pub mod manifest;
pub mod status;
pub mod version;

pub use build_line::BuildLine;
pub use change::{Change, CommitInfo};
pub use error::{LkgmError, Result};
pub use manifest::{DefaultRemote, Manifest, PendingCommit, Project, Remote};
pub use status::{BuildStatus, BuilderStatusRecord, ClCategory, ClStatus, ClStatusRecord};
pub use version::Version;
