//! Multi-tick pre-submission scenarios driven through the public API.

use std::sync::Arc;

use lkgm_core::fakes::{FakeLauncher, FakePatchProvider, FakeTreeStatus};
use lkgm_core::{
    Change, ClCategory, ClStatus, FakeClock, PreSubmissionLauncher, PresubmitConfig,
    StaticDependencies, TransactionPartitioner, ValidationPool,
};
use manifest_ledger::fakes::MemoryLedger;

struct Scenario {
    clock: FakeClock,
    review: Arc<FakePatchProvider>,
    jobs: Arc<FakeLauncher>,
    launcher: PreSubmissionLauncher,
}

fn scenario(deps: StaticDependencies) -> Scenario {
    let clock = FakeClock::default();
    let review = Arc::new(FakePatchProvider::new());
    let jobs = Arc::new(FakeLauncher::new());
    let config = PresubmitConfig::default();
    let pool = ValidationPool::new(
        Arc::new(MemoryLedger::new()),
        review.clone(),
        Arc::new(clock.clone()),
        5,
    )
    .with_tree_status(Arc::new(FakeTreeStatus::open()));
    let partitioner = TransactionPartitioner::new(Arc::new(deps), config.max_txn_length);
    Scenario {
        launcher: PreSubmissionLauncher::new(pool, partitioner, jobs.clone(), config),
        clock,
        review,
        jobs,
    }
}

async fn status(s: &Scenario, change: u64) -> ClStatus {
    s.launcher
        .pool()
        .get_status(ClCategory::PreSubmission, change)
        .await
        .unwrap()
}

#[tokio::test]
async fn chained_changes_time_out_and_are_rejected_together() {
    // B depends on A, C depends on B.
    let mut s = scenario(StaticDependencies::new().with_edge(2, 1).with_edge(3, 2));
    for n in [1, 2, 3] {
        s.review.add_ready(Change::new(n, "platform/ec", format!("c{n}")));
    }

    let first = s.launcher.tick().await.unwrap();
    assert_eq!(first.launched.len(), 1);
    assert_eq!(s.jobs.launched(), vec![vec![1, 2, 3]]);

    // Nobody picked the job up: one retry and a relaunch.
    s.clock.advance(chrono::Duration::minutes(91));
    let second = s.launcher.tick().await.unwrap();
    assert_eq!(second.retried, vec![1, 2, 3]);
    assert_eq!(second.launched.len(), 1);
    assert_eq!(s.jobs.launch_count(), 2);

    // B and C start; A's job never does.
    for n in [2, 3] {
        s.launcher
            .pool()
            .set_status(ClCategory::PreSubmission, n, ClStatus::Inflight)
            .await
            .unwrap();
    }
    s.clock.advance(chrono::Duration::minutes(91));
    let third = s.launcher.tick().await.unwrap();
    assert_eq!(third.rejected, vec![1, 2, 3]);
    assert!(third.launched.is_empty());

    for n in [1, 2, 3] {
        assert_eq!(status(&s, n).await, ClStatus::Failed);
        assert_eq!(s.review.notifications_for(n).len(), 1, "change {n}");
        assert!(!s.review.is_ready(n));
    }
    assert!(s.review.notifications_for(2)[0].contains("CL:1"));

    let fourth = s.launcher.tick().await.unwrap();
    assert!(fourth.launched.is_empty());
    assert_eq!(s.jobs.launch_count(), 2);
}

#[tokio::test]
async fn independent_transactions_progress_separately() {
    let mut s = scenario(StaticDependencies::new().with_edge(2, 1));
    for n in [1, 2, 3] {
        s.review.add_ready(Change::new(n, "p", format!("c{n}")));
    }
    s.launcher.tick().await.unwrap();
    assert_eq!(s.jobs.launched(), vec![vec![1, 2], vec![3]]);

    let pool = s.launcher.pool();
    for to in [ClStatus::Inflight, ClStatus::Passed] {
        pool.set_status(ClCategory::PreSubmission, 3, to).await.unwrap();
    }
    for to in [ClStatus::Inflight, ClStatus::Failed] {
        for n in [1, 2] {
            pool.set_status(ClCategory::PreSubmission, n, to).await.unwrap();
        }
    }

    let report = s.launcher.tick().await.unwrap();
    assert_eq!(report.retried, vec![1, 2]);
    assert_eq!(s.jobs.launched(), vec![vec![1, 2], vec![3], vec![1, 2]]);
    assert_eq!(status(&s, 3).await, ClStatus::Passed);
}
