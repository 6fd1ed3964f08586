//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryLedger`, a `LedgerStore` that keeps every revision as a
//! full snapshot. Several agents can share one `Arc<MemoryLedger>` to exercise
//! push races; failures can be injected to exercise retry paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

type Snapshot = BTreeMap<String, Vec<u8>>;

/// In-memory ledger backed by a `Vec` of snapshots, one per revision.
///
/// Revision ids are `r<index>`; `r0` is the empty initial revision.
#[derive(Debug)]
pub struct MemoryLedger {
    revisions: Mutex<Vec<Snapshot>>,
    unreachable: AtomicBool,
    reject_next: AtomicU32,
    commits: AtomicU32,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self {
            revisions: Mutex::new(vec![Snapshot::new()]),
            unreachable: AtomicBool::new(false),
            reject_next: AtomicU32::new(0),
            commits: AtomicU32::new(0),
        }
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the remote going away (or coming back).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Reject the next `n` commits as if another writer had won the race.
    pub fn reject_next_commits(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// Number of commits that were accepted.
    pub fn accepted_commits(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Read a file at the current tip without going through a revision.
    pub fn read_tip(&self, path: &str) -> Option<Vec<u8>> {
        let revisions = self.revisions.lock().unwrap_or_else(|e| e.into_inner());
        revisions.last().and_then(|s| s.get(path).cloned())
    }

    fn check_reachable(&self) -> StorageResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StorageError::Unreachable {
                detail: "memory ledger marked unreachable".to_string(),
            });
        }
        Ok(())
    }

    fn index_of(revision: &LedgerRevision) -> StorageResult<usize> {
        revision
            .as_str()
            .strip_prefix('r')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| StorageError::UnknownRevision {
                revision: revision.to_string(),
            })
    }

    fn snapshot_at(&self, at: &LedgerRevision) -> StorageResult<Snapshot> {
        let index = Self::index_of(at)?;
        let revisions = self.revisions.lock().unwrap_or_else(|e| e.into_inner());
        revisions
            .get(index)
            .cloned()
            .ok_or_else(|| StorageError::UnknownRevision {
                revision: at.to_string(),
            })
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn fetch_tip(&self) -> StorageResult<LedgerRevision> {
        self.check_reachable()?;
        let revisions = self.revisions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(LedgerRevision(format!("r{}", revisions.len() - 1)))
    }

    async fn read(&self, at: &LedgerRevision, path: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_path(path)?;
        Ok(self.snapshot_at(at)?.get(path).cloned())
    }

    async fn list(&self, at: &LedgerRevision, dir: &str) -> StorageResult<Vec<String>> {
        validate_path(dir)?;
        let prefix = format!("{dir}/");
        let names = self
            .snapshot_at(at)?
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        Ok(names)
    }

    async fn commit(
        &self,
        base: &LedgerRevision,
        commit: LedgerCommit,
    ) -> StorageResult<LedgerRevision> {
        self.check_reachable()?;
        for write in &commit.writes {
            validate_path(&write.path)?;
        }
        let base_index = Self::index_of(base)?;

        let mut revisions = self.revisions.lock().unwrap_or_else(|e| e.into_inner());
        let injected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || base_index + 1 != revisions.len() {
            return Err(StorageError::PushRejected {
                base: base.to_string(),
            });
        }

        let mut next = revisions[base_index].clone();
        for write in commit.writes {
            next.insert(write.path, write.contents);
        }
        revisions.push(next);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(LedgerRevision(format!("r{}", revisions.len() - 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_base_is_rejected() {
        let ledger = MemoryLedger::new();
        let base = ledger.fetch_tip().await.unwrap();
        ledger
            .commit(&base, LedgerCommit::new("first").with_write("a/x", "1"))
            .await
            .unwrap();
        let err = ledger
            .commit(&base, LedgerCommit::new("second").with_write("a/y", "2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PushRejected { .. }));
        assert_eq!(ledger.accepted_commits(), 1);
    }

    #[tokio::test]
    async fn injected_rejections_are_consumed() {
        let ledger = MemoryLedger::new();
        ledger.reject_next_commits(1);
        let tip = ledger.fetch_tip().await.unwrap();
        assert!(ledger
            .commit(&tip, LedgerCommit::new("m").with_write("f", "1"))
            .await
            .is_err());
        assert!(ledger
            .commit(&tip, LedgerCommit::new("m").with_write("f", "1"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn old_revisions_stay_readable() {
        let ledger = MemoryLedger::new();
        let r0 = ledger.fetch_tip().await.unwrap();
        let r1 = ledger
            .commit(&r0, LedgerCommit::new("m").with_write("d/f", "v1"))
            .await
            .unwrap();
        ledger
            .commit(&r1, LedgerCommit::new("m").with_write("d/f", "v2"))
            .await
            .unwrap();
        assert_eq!(ledger.read(&r1, "d/f").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(ledger.read(&r0, "d/f").await.unwrap(), None);
        assert_eq!(ledger.read_tip("d/f"), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn list_only_returns_direct_children() {
        let ledger = MemoryLedger::new();
        let r0 = ledger.fetch_tip().await.unwrap();
        let r1 = ledger
            .commit(
                &r0,
                LedgerCommit::new("m")
                    .with_write("line/1.0.0-rc1.xml", "a")
                    .with_write("line/nested/deep.json", "b")
                    .with_write("other/x", "c"),
            )
            .await
            .unwrap();
        let names = ledger.list(&r1, "line").await.unwrap();
        assert_eq!(names, vec!["1.0.0-rc1.xml".to_string()]);
        assert!(ledger.list(&r1, "missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_fails_fetch() {
        let ledger = MemoryLedger::new();
        ledger.set_unreachable(true);
        assert!(matches!(
            ledger.fetch_tip().await,
            Err(StorageError::Unreachable { .. })
        ));
    }
}
