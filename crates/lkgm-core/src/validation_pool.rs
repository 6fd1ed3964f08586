//! Ready changes and their per-tier status.
//!
//! CL status lives at `cl-status/<category>/<change>.json`; each file has a
//! single owner (the tier's coordinator), so writes never need merging. A
//! missing file means the change is `waiting`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use manifest_ledger::{LedgerCommit, LedgerRevision, LedgerStore};
use tracing::{info, instrument, warn};

use crate::capabilities::{PatchProvider, TreeStatus};
use crate::clock::Clock;
use crate::domain::{Change, ClCategory, ClStatus, ClStatusRecord, LkgmError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::{commit_with_retry, Attempt};

pub fn cl_status_path(category: ClCategory, change: u64) -> String {
    format!("cl-status/{}/{}.json", category.dir(), change)
}

/// Split `changes` into the first change per (project, change-id) and the
/// later duplicates. Changes without a change-id are never duplicates.
pub fn filter_duplicates(changes: Vec<Change>) -> (Vec<Change>, Vec<Change>) {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(changes.len());
    let mut duplicates = Vec::new();
    for change in changes {
        let fresh = match &change.change_id {
            Some(id) => seen.insert((change.project.clone(), id.clone())),
            None => true,
        };
        if fresh {
            kept.push(change);
        } else {
            duplicates.push(change);
        }
    }
    (kept, duplicates)
}

pub struct ValidationPool {
    ledger: Arc<dyn LedgerStore>,
    patches: Arc<dyn PatchProvider>,
    tree: Option<Arc<dyn TreeStatus>>,
    clock: Arc<dyn Clock>,
    retries: u32,
}

impl ValidationPool {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        patches: Arc<dyn PatchProvider>,
        clock: Arc<dyn Clock>,
        retries: u32,
    ) -> Self {
        Self {
            ledger,
            patches,
            tree: None,
            clock,
            retries: retries.max(1),
        }
    }

    pub fn with_tree_status(mut self, tree: Arc<dyn TreeStatus>) -> Self {
        self.tree = Some(tree);
        self
    }

    pub fn patches(&self) -> &Arc<dyn PatchProvider> {
        &self.patches
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether the tree is open; an unconfigured tree status counts as open.
    pub async fn tree_is_open(&self) -> Result<bool> {
        match &self.tree {
            Some(tree) => tree.is_open().await,
            None => Ok(true),
        }
    }

    /// Ready changes for `query`, duplicates removed, ordered by number.
    ///
    /// With `check_tree`, a closed tree fails with `TreeClosed` before the
    /// review system is queried.
    #[instrument(skip(self))]
    pub async fn acquire_ready_changes(&self, query: &str, check_tree: bool) -> Result<Vec<Change>> {
        if check_tree && !self.tree_is_open().await? {
            return Err(LkgmError::TreeClosed {
                detail: "tree status reports closed".to_string(),
            });
        }
        let mut changes = self.patches.query_ready(query).await?;
        changes.sort_by_key(|c| c.number);
        let (kept, duplicates) = filter_duplicates(changes);
        for dup in &duplicates {
            warn!(
                change = dup.number,
                change_id = ?dup.change_id,
                project = %dup.project,
                "ignoring duplicate change-id"
            );
        }
        info!(ready = kept.len(), "acquired ready changes");
        Ok(kept)
    }

    async fn record_at(
        &self,
        at: &LedgerRevision,
        category: ClCategory,
        change: u64,
    ) -> Result<ClStatusRecord> {
        match self.ledger.read(at, &cl_status_path(category, change)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(ClStatusRecord::initial(category, change, self.clock.now())),
        }
    }

    pub async fn get_record(&self, category: ClCategory, change: u64) -> Result<ClStatusRecord> {
        let tip = self.ledger.fetch_tip().await?;
        self.record_at(&tip, category, change).await
    }

    pub async fn get_status(&self, category: ClCategory, change: u64) -> Result<ClStatus> {
        Ok(self.get_record(category, change).await?.status)
    }

    /// Records for every change, read at one ledger revision.
    pub async fn get_records(
        &self,
        category: ClCategory,
        changes: &[Change],
    ) -> Result<HashMap<u64, ClStatusRecord>> {
        let tip = self.ledger.fetch_tip().await?;
        let records = try_join_all(
            changes
                .iter()
                .map(|c| self.record_at(&tip, category, c.number)),
        )
        .await?;
        Ok(records.into_iter().map(|r| (r.change, r)).collect())
    }

    /// Move `change` to `to`, validating the transition against the record
    /// at the tip of every attempt.
    #[instrument(skip(self))]
    pub async fn set_status(
        &self,
        category: ClCategory,
        change: u64,
        to: ClStatus,
    ) -> Result<ClStatusRecord> {
        let path = cl_status_path(category, change);
        let now = self.clock.now();

        let outcome = commit_with_retry(&self.ledger, self.retries, &path, |tip| {
            let path = path.clone();
            async move {
                let current = self.record_at(&tip, category, change).await?;
                let next = current.transition(to, now)?;
                if next == current {
                    return Ok(Attempt::Done((current.status, next)));
                }
                let body = serde_json::to_vec_pretty(&next)?;
                Ok(Attempt::Commit {
                    commit: LedgerCommit::new(format!("Automatic: {category} CL:{change} {to}"))
                        .with_write(path, body),
                    value: (current.status, next),
                })
            }
        })
        .await;

        let ((from, record), _) = outcome.map_err(|f| f.into_last())?;
        if from != record.status {
            obs::emit_cl_status_changed(category, change, from, record.status);
        }
        Ok(record)
    }

    /// Tell the author why, drop the ready marker and mark the change failed.
    #[instrument(skip(self, change, reason), fields(change = change.number))]
    pub async fn reject(&self, category: ClCategory, change: &Change, reason: &str) -> Result<()> {
        self.patches.notify(change, reason).await?;
        self.patches.remove_ready(change).await?;
        self.set_status(category, change.number, ClStatus::Failed)
            .await?;
        METRICS.inc_rejections();
        obs::emit_change_rejected(change.number, reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::fakes::{FakePatchProvider, FakeTreeStatus};
    use manifest_ledger::fakes::MemoryLedger;

    struct Harness {
        mem: Arc<MemoryLedger>,
        review: Arc<FakePatchProvider>,
        tree: Arc<FakeTreeStatus>,
        pool: ValidationPool,
    }

    fn harness() -> Harness {
        let mem = Arc::new(MemoryLedger::new());
        let review = Arc::new(FakePatchProvider::new());
        let tree = Arc::new(FakeTreeStatus::open());
        let pool = ValidationPool::new(mem.clone(), review.clone(), Arc::new(FakeClock::default()), 3)
            .with_tree_status(tree.clone());
        Harness {
            mem,
            review,
            tree,
            pool,
        }
    }

    #[test]
    fn duplicates_keep_the_first_change() {
        let changes = vec![
            Change::new(1, "p", "a").with_change_id("I1"),
            Change::new(2, "p", "b").with_change_id("I1"),
            Change::new(3, "q", "c").with_change_id("I1"),
            Change::new(4, "p", "d"),
            Change::new(5, "p", "e"),
        ];
        let (kept, dups) = filter_duplicates(changes);
        let kept: Vec<u64> = kept.iter().map(|c| c.number).collect();
        assert_eq!(kept, vec![1, 3, 4, 5]);
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].number, 2);
    }

    #[tokio::test]
    async fn acquire_fails_when_tree_closed() {
        let h = harness();
        h.review.add_ready(Change::new(1, "p", "a"));
        h.tree.set_open(false);
        let err = h.pool.acquire_ready_changes("q", true).await.unwrap_err();
        assert!(err.is_no_work());

        let changes = h.pool.acquire_ready_changes("q", false).await.unwrap();
        assert_eq!(changes.len(), 1);
    }

    #[tokio::test]
    async fn unknown_change_is_waiting() {
        let h = harness();
        assert_eq!(
            h.pool.get_status(ClCategory::PreSubmission, 9).await.unwrap(),
            ClStatus::Waiting
        );
        assert_eq!(h.mem.accepted_commits(), 0);
    }

    #[tokio::test]
    async fn set_status_persists_and_validates() {
        let h = harness();
        h.pool
            .set_status(ClCategory::PreSubmission, 9, ClStatus::Launching)
            .await
            .unwrap();
        assert_eq!(
            h.pool.get_status(ClCategory::PreSubmission, 9).await.unwrap(),
            ClStatus::Launching
        );
        assert!(h.mem.read_tip("cl-status/pre-submission/9.json").is_some());

        let err = h
            .pool
            .set_status(ClCategory::PreSubmission, 9, ClStatus::Passed)
            .await
            .unwrap_err();
        assert!(matches!(err, LkgmError::InvalidTransition { .. }));

        // Categories are independent.
        assert_eq!(
            h.pool.get_status(ClCategory::CommitQueue, 9).await.unwrap(),
            ClStatus::Waiting
        );
    }

    #[tokio::test]
    async fn repeated_status_does_not_commit() {
        let h = harness();
        h.pool
            .set_status(ClCategory::PreSubmission, 9, ClStatus::Launching)
            .await
            .unwrap();
        let commits = h.mem.accepted_commits();
        h.pool
            .set_status(ClCategory::PreSubmission, 9, ClStatus::Launching)
            .await
            .unwrap();
        assert_eq!(h.mem.accepted_commits(), commits);
    }

    #[tokio::test]
    async fn reject_notifies_and_revokes_readiness() {
        let h = harness();
        let change = Change::new(5, "p", "a");
        h.review.add_ready(change.clone());
        h.pool
            .reject(ClCategory::PreSubmission, &change, "timed out")
            .await
            .unwrap();
        assert!(!h.review.is_ready(5));
        assert_eq!(h.review.notifications_for(5), vec!["timed out".to_string()]);
        assert_eq!(
            h.pool.get_status(ClCategory::PreSubmission, 5).await.unwrap(),
            ClStatus::Failed
        );
    }

    #[tokio::test]
    async fn get_records_reads_all_changes() {
        let h = harness();
        h.pool
            .set_status(ClCategory::PreSubmission, 1, ClStatus::Launching)
            .await
            .unwrap();
        let changes = vec![Change::new(1, "p", "a"), Change::new(2, "p", "b")];
        let records = h
            .pool
            .get_records(ClCategory::PreSubmission, &changes)
            .await
            .unwrap();
        assert_eq!(records[&1].status, ClStatus::Launching);
        assert_eq!(records[&2].status, ClStatus::Waiting);
    }
}
