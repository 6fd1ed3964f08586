//! Commit-queue master flow: ready changes in, candidate out.

use tracing::{info, instrument, warn};

use crate::candidate_manager::{CandidateManager, PublishedCandidate};
use crate::domain::{ClCategory, Result};
use crate::validation_pool::ValidationPool;

/// Cut a commit-queue candidate containing every ready change.
///
/// A closed tree is "no work" and returns `None` without touching the
/// ledger. Changes that do not apply are rejected and left out of the
/// candidate. When `secondary` is given, the published candidate is
/// mirrored into it, filtered to that manager's allowed remotes.
#[instrument(skip_all, fields(query = %query))]
pub async fn commit_queue_candidate(
    pool: &ValidationPool,
    manager: &mut CandidateManager,
    secondary: Option<&mut CandidateManager>,
    query: &str,
) -> Result<Option<PublishedCandidate>> {
    let changes = match pool.acquire_ready_changes(query, true).await {
        Ok(changes) => changes,
        Err(e) if e.is_no_work() => {
            info!(reason = %e, "tree closed; not creating a candidate");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let candidate = manager.create_candidate(&changes, false).await?;

    for (change, reason) in manager.apply_failures().to_vec() {
        let message = format!("{change} could not be applied and was left out of this run: {reason}");
        if let Err(e) = pool.reject(ClCategory::CommitQueue, &change, &message).await {
            warn!(change = change.number, error = %e, "failed to reject unappliable change");
        }
    }

    let Some(candidate) = candidate else {
        return Ok(None);
    };
    if let Some(secondary) = secondary {
        let mirrored = secondary.create_from_manifest(&candidate).await?;
        info!(
            version = %mirrored.version,
            projects = mirrored.manifest.projects.len(),
            "candidate mirrored to secondary ledger"
        );
    }
    Ok(Some(candidate))
}
