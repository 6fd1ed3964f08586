//! Push-retry loop shared by every ledger writer.
//!
//! Each attempt starts from a freshly fetched tip, so anything derived from
//! ledger contents (the next version, an existing record) is recomputed after
//! a lost race. A rejected fast-forward is the only lock the ledger offers.

use std::future::Future;
use std::sync::Arc;

use manifest_ledger::{LedgerCommit, LedgerRevision, LedgerStore, StorageError};
use tracing::{debug, warn};

use crate::domain::LkgmError;
use crate::metrics::METRICS;
use crate::obs;

/// What one attempt decided to do at a given tip.
pub(crate) enum Attempt<T> {
    /// Push `commit` on top of the tip and return `value` on success.
    Commit { commit: LedgerCommit, value: T },
    /// Nothing to write; the ledger already holds the desired state.
    Done(T),
}

pub(crate) enum PushFailure {
    /// Every attempt lost a race or could not reach the ledger.
    Exhausted { attempts: u32, last: LkgmError },
    /// A non-retryable error; no further attempts were made.
    Fatal(LkgmError),
}

impl PushFailure {
    /// Collapse into a domain error, wrapping exhaustion with `on_exhausted`
    /// unless the last failure was a refresh.
    pub(crate) fn into_error(self, on_exhausted: impl FnOnce(u32, String) -> LkgmError) -> LkgmError {
        match self {
            PushFailure::Fatal(e) => e,
            PushFailure::Exhausted { last, .. } if matches!(last, LkgmError::Refresh { .. }) => last,
            PushFailure::Exhausted { attempts, last } => on_exhausted(attempts, last.to_string()),
        }
    }

    /// The error that ended the loop, unwrapped.
    pub(crate) fn into_last(self) -> LkgmError {
        match self {
            PushFailure::Fatal(e) | PushFailure::Exhausted { last: e, .. } => e,
        }
    }
}

/// Run `prepare` against the tip and push its commit, up to `retries` times.
///
/// Returns the attempt's value and the revision it ended at (the new commit,
/// or the tip it inspected for [`Attempt::Done`]).
pub(crate) async fn commit_with_retry<T, F, Fut>(
    ledger: &Arc<dyn LedgerStore>,
    retries: u32,
    label: &str,
    mut prepare: F,
) -> std::result::Result<(T, LedgerRevision), PushFailure>
where
    F: FnMut(LedgerRevision) -> Fut,
    Fut: Future<Output = Result<Attempt<T>, LkgmError>>,
{
    let mut last = LkgmError::Refresh {
        detail: "no attempt made".to_string(),
    };
    for attempt in 1..=retries {
        let tip = match ledger.fetch_tip().await {
            Ok(tip) => tip,
            Err(e) if e.is_retryable() => {
                warn!(label = %label, attempt, error = %e, "ledger refresh failed");
                last = LkgmError::Refresh {
                    detail: e.to_string(),
                };
                continue;
            }
            Err(e) => return Err(PushFailure::Fatal(e.into())),
        };

        let (commit, value) = match prepare(tip.clone()).await.map_err(PushFailure::Fatal)? {
            Attempt::Done(value) => return Ok((value, tip)),
            Attempt::Commit { commit, value } => (commit, value),
        };

        match ledger.commit(&tip, commit).await {
            Ok(revision) => {
                debug!(label = %label, attempt, revision = %revision, "ledger commit pushed");
                return Ok((value, revision));
            }
            Err(e @ StorageError::PushRejected { .. }) | Err(e @ StorageError::Unreachable { .. }) => {
                obs::emit_push_rejected(label, attempt, retries);
                if attempt < retries {
                    METRICS.inc_push_retries();
                }
                last = e.into();
            }
            Err(e) => return Err(PushFailure::Fatal(e.into())),
        }
    }
    Err(PushFailure::Exhausted {
        attempts: retries,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifest_ledger::fakes::MemoryLedger;

    fn ledger() -> (Arc<MemoryLedger>, Arc<dyn LedgerStore>) {
        let mem = Arc::new(MemoryLedger::new());
        let dyn_ledger: Arc<dyn LedgerStore> = mem.clone();
        (mem, dyn_ledger)
    }

    fn write(path: &'static str) -> impl FnMut(LedgerRevision) -> std::future::Ready<Result<Attempt<()>, LkgmError>> {
        move |_| {
            std::future::ready(Ok(Attempt::Commit {
                commit: LedgerCommit::new("test").with_write(path, "x"),
                value: (),
            }))
        }
    }

    #[tokio::test]
    async fn retries_after_rejection() {
        let (mem, ledger) = ledger();
        mem.reject_next_commits(2);
        let result = commit_with_retry(&ledger, 3, "a", write("a/b")).await;
        assert!(result.is_ok());
        assert_eq!(mem.read_tip("a/b"), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error() {
        let (mem, ledger) = ledger();
        mem.reject_next_commits(5);
        let Err(failure) = commit_with_retry(&ledger, 2, "a", write("a/b")).await else {
            panic!("expected exhaustion");
        };
        let err = failure.into_error(|attempts, detail| LkgmError::GenerateBuildSpec {
            line: "commit-queue".into(),
            attempts,
            detail,
        });
        assert!(matches!(err, LkgmError::GenerateBuildSpec { attempts: 2, .. }));
        assert_eq!(mem.accepted_commits(), 0);
    }

    #[tokio::test]
    async fn unreachable_tip_surfaces_as_refresh_error() {
        let (mem, ledger) = ledger();
        mem.set_unreachable(true);
        let Err(failure) = commit_with_retry(&ledger, 2, "a", write("a/b")).await else {
            panic!("expected exhaustion");
        };
        let err = failure.into_error(|_, _| LkgmError::NoCandidate);
        assert!(matches!(err, LkgmError::Refresh { .. }));
    }

    #[tokio::test]
    async fn done_skips_the_push() {
        let (mem, ledger) = ledger();
        let (value, _) = commit_with_retry(&ledger, 1, "a", |_| async { Ok(Attempt::Done(7)) })
            .await
            .ok()
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(mem.accepted_commits(), 0);
    }
}
