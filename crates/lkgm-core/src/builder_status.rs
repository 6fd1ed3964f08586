//! Per-builder status records and the poller that aggregates them.
//!
//! Each builder owns `builder-status/<line>/<version>/<builder>.json` and is
//! its only writer. The master reads all of them for one candidate until
//! every required builder is terminal or the long timeout elapses.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use manifest_ledger::{LedgerCommit, LedgerRevision, LedgerStore};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::domain::{BuildLine, BuildStatus, BuilderStatusRecord, Result, Version};
use crate::poll::{PollConfig, PollState};
use crate::retry::{commit_with_retry, Attempt};

/// Latest known status per builder name.
pub type BuilderStatusMap = BTreeMap<String, BuildStatus>;

pub fn status_path(line: BuildLine, version: &Version, builder: &str) -> String {
    format!("builder-status/{}/{}/{}.json", line.dir(), version, builder)
}

/// Aggregate view of a [`BuilderStatusMap`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub inflight: Vec<String>,
    pub missing: Vec<String>,
}

impl StatusSummary {
    pub fn from_map(map: &BuilderStatusMap) -> Self {
        let mut summary = Self::default();
        for (name, status) in map {
            let bucket = match status {
                BuildStatus::Passed => &mut summary.passed,
                BuildStatus::Failed => &mut summary.failed,
                BuildStatus::Inflight => &mut summary.inflight,
                BuildStatus::Missing => &mut summary.missing,
            };
            bucket.push(name.clone());
        }
        summary
    }

    pub fn all_passed(&self) -> bool {
        self.failed.is_empty() && self.inflight.is_empty() && self.missing.is_empty()
    }

    /// Every builder reached passed or failed.
    pub fn is_complete(&self) -> bool {
        self.inflight.is_empty() && self.missing.is_empty()
    }
}

pub struct BuilderStatusPoller {
    ledger: Arc<dyn LedgerStore>,
    line: BuildLine,
    retries: u32,
    poll: PollConfig,
    clock: Arc<dyn Clock>,
    /// Terminal statuses only; those never change once written.
    terminal: HashMap<(String, Version), BuildStatus>,
}

impl BuilderStatusPoller {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        line: BuildLine,
        retries: u32,
        poll: PollConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            line,
            retries: retries.max(1),
            poll,
            clock,
            terminal: HashMap::new(),
        }
    }

    /// Write this builder's status for `version`.
    #[instrument(skip(self, message), fields(line = %self.line))]
    pub async fn report_status(
        &self,
        builder: &str,
        version: &Version,
        status: BuildStatus,
        message: Option<String>,
    ) -> Result<()> {
        let record = BuilderStatusRecord {
            builder_name: builder.to_string(),
            version: *version,
            status,
            timestamp: self.clock.now(),
            message,
        };
        let body = serde_json::to_vec_pretty(&record)?;
        let path = status_path(self.line, version, builder);

        commit_with_retry(&self.ledger, self.retries, &path, |_| {
            let commit = LedgerCommit::new(format!("Automatic: {builder} {status} {version}"))
                .with_write(path.clone(), body.clone());
            async move { Ok(Attempt::Commit { commit, value: () }) }
        })
        .await
        .map_err(|f| f.into_last())?;
        info!(builder = %builder, version = %version, status = %status, "builder status reported");
        Ok(())
    }

    /// Read one builder's record at `at`; `None` when it has not reported.
    async fn fetch(
        &self,
        at: &LedgerRevision,
        builder: &str,
        version: &Version,
    ) -> Result<Option<BuilderStatusRecord>> {
        let path = status_path(self.line, version, builder);
        match self.ledger.read(at, &path).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    /// One pass over `builders`, consulting the ledger only for builders
    /// that are not yet terminal.
    async fn refresh(&mut self, version: &Version, builders: &[String]) -> BuilderStatusMap {
        let mut map = BuilderStatusMap::new();
        let pending: Vec<&String> = builders
            .iter()
            .filter(|b| !self.terminal.contains_key(&((*b).clone(), *version)))
            .collect();

        let tip = if pending.is_empty() {
            None
        } else {
            match self.ledger.fetch_tip().await {
                Ok(tip) => Some(tip),
                Err(e) => {
                    warn!(error = %e, "cannot refresh ledger for builder statuses");
                    None
                }
            }
        };

        for builder in builders {
            let key = (builder.clone(), *version);
            if let Some(status) = self.terminal.get(&key) {
                map.insert(builder.clone(), *status);
                continue;
            }
            let status = match &tip {
                None => BuildStatus::Missing,
                Some(tip) => match self.fetch(tip, builder, version).await {
                    Ok(Some(record)) => record.status,
                    Ok(None) => BuildStatus::Missing,
                    Err(e) => {
                        warn!(builder = %builder, error = %e, "unreadable builder status");
                        BuildStatus::Missing
                    }
                },
            };
            if status.is_terminal() {
                self.terminal.insert(key, status);
            }
            map.insert(builder.clone(), status);
        }
        map
    }

    /// Statuses of `builders` for `version`.
    ///
    /// With `wait`, polls until every builder is terminal or the timeout
    /// elapses. The latest map is returned either way; the caller decides
    /// whether an incomplete map is a failure.
    #[instrument(skip(self, builders), fields(line = %self.line, builders = builders.len()))]
    pub async fn get_builders_status(
        &mut self,
        version: &Version,
        builders: &[String],
        wait: bool,
    ) -> BuilderStatusMap {
        let mut state = PollState::start(self.poll);
        loop {
            let map = self.refresh(version, builders).await;
            if !wait || map.values().all(BuildStatus::is_terminal) {
                return map;
            }
            debug!(
                remaining_secs = state.remaining().as_secs(),
                waiting_on = ?map.iter().filter(|(_, s)| !s.is_terminal()).map(|(n, _)| n).collect::<Vec<_>>(),
                "builders still running"
            );
            if !state.wait().await {
                warn!(version = %version, "timed out waiting for builder statuses");
                return map;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use manifest_ledger::fakes::MemoryLedger;
    use std::time::Duration;

    fn v() -> Version {
        Version::parse("41.0.0-rc1").unwrap()
    }

    fn poller(mem: &Arc<MemoryLedger>) -> BuilderStatusPoller {
        BuilderStatusPoller::new(
            mem.clone(),
            BuildLine::CommitQueue,
            3,
            PollConfig::new(Duration::from_secs(30), Duration::from_secs(300)),
            Arc::new(FakeClock::default()),
        )
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn unreported_builders_are_missing() {
        let mem = Arc::new(MemoryLedger::new());
        let mut poller = poller(&mem);
        let map = poller.get_builders_status(&v(), &names(&["a"]), false).await;
        assert_eq!(map["a"], BuildStatus::Missing);
    }

    #[tokio::test]
    async fn reported_status_is_read_back() {
        let mem = Arc::new(MemoryLedger::new());
        let mut poller = poller(&mem);
        poller
            .report_status("a", &v(), BuildStatus::Passed, None)
            .await
            .unwrap();
        poller
            .report_status("b", &v(), BuildStatus::Inflight, Some("building".into()))
            .await
            .unwrap();
        let map = poller.get_builders_status(&v(), &names(&["a", "b"]), false).await;
        assert_eq!(map["a"], BuildStatus::Passed);
        assert_eq!(map["b"], BuildStatus::Inflight);
        assert!(mem
            .read_tip("builder-status/commit-queue/41.0.0-rc1/a.json")
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_partial_map_on_timeout() {
        let mem = Arc::new(MemoryLedger::new());
        let mut poller = poller(&mem);
        poller
            .report_status("a", &v(), BuildStatus::Passed, None)
            .await
            .unwrap();
        let start = tokio::time::Instant::now();
        let map = poller.get_builders_status(&v(), &names(&["a", "b"]), true).await;
        assert!(start.elapsed() <= Duration::from_secs(330));
        let summary = StatusSummary::from_map(&map);
        assert_eq!(summary.passed, names(&["a"]));
        assert_eq!(summary.missing, names(&["b"]));
        assert!(!summary.is_complete());
        assert!(!summary.all_passed());
    }

    #[tokio::test]
    async fn terminal_statuses_are_cached() {
        let mem = Arc::new(MemoryLedger::new());
        let mut poller = poller(&mem);
        poller
            .report_status("a", &v(), BuildStatus::Failed, None)
            .await
            .unwrap();
        let map = poller.get_builders_status(&v(), &names(&["a"]), true).await;
        assert_eq!(map["a"], BuildStatus::Failed);

        // A cached terminal status does not need the ledger at all.
        mem.set_unreachable(true);
        let map = poller.get_builders_status(&v(), &names(&["a"]), true).await;
        assert_eq!(map["a"], BuildStatus::Failed);
    }

    #[test]
    fn summary_all_passed() {
        let map: BuilderStatusMap = [
            ("a".to_string(), BuildStatus::Passed),
            ("b".to_string(), BuildStatus::Passed),
        ]
        .into_iter()
        .collect();
        let summary = StatusSummary::from_map(&map);
        assert!(summary.all_passed());
        assert!(summary.is_complete());
    }
}
