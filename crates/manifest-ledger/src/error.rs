//! Error types for manifest-ledger

use thiserror::Error;

/// Errors that can occur in the ledger storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// The ledger remote could not be reached (fetch or push transport failure)
    #[error("ledger unreachable: {detail}")]
    Unreachable { detail: String },

    /// A write was based on a revision that is no longer the ledger tip
    #[error("push rejected: base {base} is not the ledger tip")]
    PushRejected { base: String },

    /// The requested revision does not exist in the ledger
    #[error("unknown ledger revision: {revision}")]
    UnknownRevision { revision: String },

    /// A path was empty, absolute, or escaped the ledger root
    #[error("invalid ledger path: {path}")]
    InvalidPath { path: String },

    /// Invalid content digest format
    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    /// Backend command failed for a reason other than transport or rejection
    #[error("ledger backend error: {0}")]
    Backend(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether the failure is expected to clear after re-reading the tip and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::PushRejected { .. } | StorageError::Unreachable { .. }
        )
    }
}
