//! Structured observability hooks for candidate and CL lifecycle events.
//!
//! This module provides:
//! - Candidate-scoped tracing spans via the `CandidateSpan` RAII guard
//! - Emission functions for publication, promotion, push races, CL status
//!   changes, launches and rejections
//!
//! Events are emitted at `info!` level (push races and rejections at
//! `warn!`). Filtering follows `RUST_LOG`; see [`crate::telemetry`].

use tracing::{info, warn};

use crate::domain::{BuildLine, ClCategory, ClStatus, Version};

/// RAII guard that enters a span tagged with the build line and candidate.
///
/// # Example
///
/// ```ignore
/// let _span = CandidateSpan::enter(BuildLine::CommitQueue, &version);
/// // every event below carries line=commit-queue version=41.0.0-rc3
/// ```
pub struct CandidateSpan {
    _span: tracing::span::EnteredSpan,
}

impl CandidateSpan {
    pub fn enter(line: BuildLine, version: &Version) -> Self {
        let span = tracing::info_span!("lkgm.candidate", line = %line, version = %version);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: a candidate file landed in the ledger.
pub fn emit_candidate_published(line: BuildLine, version: &Version, attempt: u32) {
    info!(
        event = "candidate.published",
        line = %line,
        version = %version,
        attempt = attempt,
    );
}

/// Emit event: a push lost the race against another writer.
pub fn emit_push_rejected(path: &str, attempt: u32, retries: u32) {
    warn!(event = "ledger.push_rejected", path = %path, attempt = attempt, retries = retries);
}

/// Emit event: the baseline pointer now references `version`.
pub fn emit_candidate_promoted(line: BuildLine, version: &Version) {
    info!(event = "candidate.promoted", line = %line, version = %version);
}

pub fn emit_cl_status_changed(category: ClCategory, change: u64, from: ClStatus, to: ClStatus) {
    info!(
        event = "cl.status_changed",
        category = %category,
        change = change,
        from = %from,
        to = %to,
    );
}

/// Emit event: one speculative job launched for a transaction.
pub fn emit_transaction_launched(job: &str, changes: &[u64]) {
    info!(event = "transaction.launched", job = %job, changes = ?changes);
}

pub fn emit_change_rejected(change: u64, reason: &str) {
    warn!(event = "cl.rejected", change = change, reason = %reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_span_create() {
        let version = Version::parse("41.0.0-rc1").unwrap();
        let _span = CandidateSpan::enter(BuildLine::CommitQueue, &version);
        emit_candidate_published(BuildLine::CommitQueue, &version, 1);
    }
}
