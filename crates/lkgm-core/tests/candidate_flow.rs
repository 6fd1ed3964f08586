//! End-to-end candidate flows over the in-memory ledger: racing masters,
//! master/slave hand-off, builder status exchange and promotion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lkgm_core::fakes::FakeRepository;
use lkgm_core::{
    BuildLine, BuildStatus, BuilderStatusPoller, CandidateManager, FakeClock, Manifest,
    ManifestStore, PollConfig, Project, StatusSummary, Version,
};
use manifest_ledger::fakes::MemoryLedger;
use manifest_ledger::{LedgerCommit, LedgerRevision, LedgerStore, StorageError, StorageResult};

fn v(s: &str) -> Version {
    Version::parse(s).unwrap()
}

fn snapshot(rev: &str) -> Manifest {
    Manifest::new()
        .with_remote("cros", "https://example.org")
        .with_default("cros", "main")
        .with_project(Project::new("platform/ec", rev))
        .with_project(Project::new("chromiumos/overlays", "o1"))
}

fn poll() -> PollConfig {
    PollConfig::new(Duration::from_secs(30), Duration::from_secs(300))
}

fn manager(ledger: Arc<dyn LedgerStore>, repo: Arc<FakeRepository>) -> CandidateManager {
    CandidateManager::new(ManifestStore::new(ledger, 5), repo, BuildLine::CommitQueue, poll())
}

/// Lets another master land a candidate between our tip read and our push.
struct RacingLedger {
    inner: Arc<MemoryLedger>,
    competitor: String,
    raced: AtomicBool,
}

#[async_trait]
impl LedgerStore for RacingLedger {
    async fn fetch_tip(&self) -> StorageResult<LedgerRevision> {
        self.inner.fetch_tip().await
    }

    async fn read(&self, at: &LedgerRevision, path: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.read(at, path).await
    }

    async fn list(&self, at: &LedgerRevision, dir: &str) -> StorageResult<Vec<String>> {
        self.inner.list(at, dir).await
    }

    async fn commit(
        &self,
        base: &LedgerRevision,
        commit: LedgerCommit,
    ) -> StorageResult<LedgerRevision> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            let tip = self.inner.fetch_tip().await?;
            self.inner
                .commit(
                    &tip,
                    LedgerCommit::new("Automatic: Start commit-queue (other master)")
                        .with_write(self.competitor.clone(), snapshot("other").render()),
                )
                .await?;
        }
        self.inner.commit(base, commit).await
    }
}

#[tokio::test]
async fn losing_master_publishes_next_revision() {
    let mem = Arc::new(MemoryLedger::new());
    let repo = Arc::new(FakeRepository::new(snapshot("a"), v("41.0.0")));

    let mut first = manager(mem.clone(), repo.clone());
    first.create_candidate(&[], true).await.unwrap().unwrap();
    first.create_candidate(&[], true).await.unwrap().unwrap();

    let racing = Arc::new(RacingLedger {
        inner: mem.clone(),
        competitor: BuildLine::CommitQueue.candidate_path(&v("41.0.0-rc3")),
        raced: AtomicBool::new(false),
    });
    repo.set_manifest(snapshot("b"));
    let mut second = manager(racing, repo.clone());
    let candidate = second.create_candidate(&[], false).await.unwrap().unwrap();

    assert_eq!(candidate.version, v("41.0.0-rc4"));
    let winner = mem.read_tip("commit-queue/41.0.0-rc3.xml").unwrap();
    assert_eq!(winner, snapshot("other").render().into_bytes());
    let ours = mem.read_tip("commit-queue/41.0.0-rc4.xml").unwrap();
    assert_eq!(ours, snapshot("b").render().into_bytes());
}

#[tokio::test]
async fn stale_local_version_with_no_changes_is_no_work() {
    let mem = Arc::new(MemoryLedger::new());
    let repo = Arc::new(FakeRepository::new(snapshot("a"), v("41.0.0")));
    let mut master = manager(mem.clone(), repo.clone());
    for _ in 0..3 {
        master.create_candidate(&[], true).await.unwrap().unwrap();
    }
    let commits = mem.accepted_commits();

    repo.set_version(v("41.0.0-rc2"));
    let mut again = manager(mem.clone(), repo);
    assert!(again.create_candidate(&[], false).await.unwrap().is_none());
    assert_eq!(mem.accepted_commits(), commits);
}

/// Fails the first tip fetch as if the ledger host blipped.
struct FlakyTipLedger {
    inner: Arc<MemoryLedger>,
    failed: AtomicBool,
}

#[async_trait]
impl LedgerStore for FlakyTipLedger {
    async fn fetch_tip(&self) -> StorageResult<LedgerRevision> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(StorageError::Unreachable {
                detail: "transient".to_string(),
            });
        }
        self.inner.fetch_tip().await
    }

    async fn read(&self, at: &LedgerRevision, path: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.read(at, path).await
    }

    async fn list(&self, at: &LedgerRevision, dir: &str) -> StorageResult<Vec<String>> {
        self.inner.list(at, dir).await
    }

    async fn commit(
        &self,
        base: &LedgerRevision,
        commit: LedgerCommit,
    ) -> StorageResult<LedgerRevision> {
        self.inner.commit(base, commit).await
    }
}

#[tokio::test]
async fn transient_refresh_failure_is_retried() {
    let mem = Arc::new(MemoryLedger::new());
    let flaky = Arc::new(FlakyTipLedger {
        inner: mem.clone(),
        failed: AtomicBool::new(false),
    });
    let repo = Arc::new(FakeRepository::new(snapshot("a"), v("41.0.0")));
    let mut master = manager(flaky.clone(), repo);

    let candidate = master.create_candidate(&[], false).await.unwrap().unwrap();
    assert_eq!(candidate.version, v("41.0.0-rc1"));
    assert!(flaky.failed.load(Ordering::SeqCst));
    assert!(mem.read_tip("commit-queue/41.0.0-rc1.xml").is_some());
}

#[tokio::test(start_paused = true)]
async fn master_slave_round_trip_promotes_candidate() {
    let mem = Arc::new(MemoryLedger::new());
    let master_repo = Arc::new(FakeRepository::new(snapshot("a"), v("41.0.0")));
    let slave_repo = Arc::new(FakeRepository::new(Manifest::new(), v("41.0.0")));
    let clock = Arc::new(FakeClock::default());

    let mut master = manager(mem.clone(), master_repo);
    let mut slave = manager(mem.clone(), slave_repo.clone());

    let published = master.create_candidate(&[], false).await.unwrap().unwrap();
    assert_eq!(published.version, v("41.0.0-rc1"));

    let synced = slave.get_latest_candidate().await.unwrap().unwrap();
    assert_eq!(synced.version, published.version);
    assert_eq!(slave_repo.checkouts(), vec![published.manifest.clone()]);

    let builders = vec!["master-paladin".to_string(), "x86-paladin".to_string()];
    let reporter = BuilderStatusPoller::new(
        mem.clone(),
        BuildLine::CommitQueue,
        5,
        poll(),
        clock.clone(),
    );
    reporter
        .report_status("x86-paladin", &synced.version, BuildStatus::Passed, None)
        .await
        .unwrap();
    reporter
        .report_status("master-paladin", &published.version, BuildStatus::Passed, None)
        .await
        .unwrap();

    let mut poller = BuilderStatusPoller::new(mem.clone(), BuildLine::CommitQueue, 5, poll(), clock);
    let statuses = poller
        .get_builders_status(&published.version, &builders, true)
        .await;
    assert!(StatusSummary::from_map(&statuses).all_passed());

    master.promote_candidate().await.unwrap();
    assert_eq!(
        master.store_mut().baseline().await.unwrap(),
        Some((BuildLine::CommitQueue, published.version))
    );
    assert_eq!(
        mem.read_tip("LKGM/lkgm.xml").unwrap(),
        b"commit-queue/41.0.0-rc1.xml\n".to_vec()
    );

    // Nothing newer: the slave waits out its timeout.
    assert!(slave.get_latest_candidate().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn slave_picks_up_candidate_published_while_waiting() {
    let mem = Arc::new(MemoryLedger::new());
    let master_repo = Arc::new(FakeRepository::new(snapshot("a"), v("41.0.0")));
    let slave_repo = Arc::new(FakeRepository::new(Manifest::new(), v("41.0.0")));
    let mut master = manager(mem.clone(), master_repo);
    let mut slave = manager(mem.clone(), slave_repo);

    let waiter = tokio::spawn(async move {
        let found = slave.get_latest_candidate().await.unwrap();
        found.map(|c| c.version)
    });
    tokio::time::sleep(Duration::from_secs(45)).await;
    master.create_candidate(&[], false).await.unwrap().unwrap();

    assert_eq!(waiter.await.unwrap(), Some(v("41.0.0-rc1")));
}
