//! Pre-submission launcher.
//!
//! One [`PreSubmissionLauncher::tick`] per cycle:
//!
//! 1. read ready changes and their CL status
//! 2. enforce per-change timeouts and the single failed → waiting retry
//! 3. partition the ready changes into transactions
//! 4. reject every transaction containing a terminally failed change
//! 5. launch one job per idle transaction, subject to the throttles
//!
//! A change's status is the only state carried between ticks, so any agent
//! can run the next tick.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{JobId, TrybotLauncher};
use crate::config::PresubmitConfig;
use crate::domain::{Change, ClCategory, ClStatus, ClStatusRecord, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::partition::{Transaction, TransactionPartitioner};
use crate::validation_pool::ValidationPool;

const CATEGORY: ClCategory = ClCategory::PreSubmission;

fn launch_timeout_message(minutes: i64) -> String {
    format!(
        "The pre-submission job for your change did not start within {minutes} minutes, \
         twice.\n\nIf your change is not at fault you may mark it as ready again."
    )
}

fn inflight_timeout_message(minutes: i64) -> String {
    format!(
        "The pre-submission job for your change timed out after {minutes} minutes.\n\n\
         This problem can happen if your change causes the builder to hang, or if there \
         is some infrastructure issue. If your change is not at fault you may mark your \
         change as ready again. If this problem occurs multiple times please notify the \
         sheriff and file a bug."
    )
}

const REPEATED_FAILURE_MESSAGE: &str =
    "Pre-submission verification failed for your change after a retry.";

fn companion_message(culprit: u64, reason: &str) -> String {
    format!("CL:{culprit}, which must be tested together with your change, was rejected:\n\n{reason}")
}

fn oversized_message(len: usize, max: usize) -> String {
    format!(
        "Your change belongs to a group of {len} dependent changes, more than the {max} \
         that can be tested together. Please split the stack."
    )
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct LaunchReport {
    pub launched: Vec<(JobId, Vec<u64>)>,
    /// Changes returned to `waiting` for their single retry.
    pub retried: Vec<u64>,
    pub rejected: Vec<u64>,
    /// Transactions left alone because a member is launching or inflight.
    pub busy: Vec<Vec<u64>>,
    /// Transactions waiting on a change that is not ready.
    pub blocked: Vec<Vec<u64>>,
    /// Transactions with a member approved too recently.
    pub delayed: Vec<Vec<u64>>,
    /// Transactions not launched because of the tree or the cycle limit.
    pub throttled: Vec<Vec<u64>>,
    pub tree_closed: bool,
}

pub struct PreSubmissionLauncher {
    pool: ValidationPool,
    partitioner: TransactionPartitioner,
    launcher: Arc<dyn TrybotLauncher>,
    config: PresubmitConfig,
    last_cycle_launches: usize,
}

impl PreSubmissionLauncher {
    pub fn new(
        pool: ValidationPool,
        partitioner: TransactionPartitioner,
        launcher: Arc<dyn TrybotLauncher>,
        config: PresubmitConfig,
    ) -> Self {
        Self {
            pool,
            partitioner,
            launcher,
            config,
            last_cycle_launches: 0,
        }
    }

    pub fn pool(&self) -> &ValidationPool {
        &self.pool
    }

    /// Run one launch cycle.
    #[instrument(skip(self))]
    pub async fn tick(&mut self) -> Result<LaunchReport> {
        let mut report = LaunchReport::default();
        let now = self.pool.clock().now();
        let ready = self
            .pool
            .acquire_ready_changes(&self.config.ready_query, false)
            .await?;
        if ready.is_empty() {
            debug!("no ready changes");
            self.last_cycle_launches = 0;
            return Ok(report);
        }
        let mut records = self.pool.get_records(CATEGORY, &ready).await?;

        // Timeouts and retries; collects changes that must be rejected.
        let mut doomed: BTreeMap<u64, String> = BTreeMap::new();
        for change in &ready {
            let Some(record) = records.get(&change.number).cloned() else {
                continue;
            };
            match self.process_timeouts(&record, now) {
                Verdict::Keep => {}
                Verdict::Retry => {
                    let updated = self
                        .pool
                        .set_status(CATEGORY, change.number, ClStatus::Waiting)
                        .await?;
                    info!(change = change.number, from = %record.status, "returning change to waiting for its retry");
                    records.insert(change.number, updated);
                    report.retried.push(change.number);
                }
                Verdict::Reject(reason) => {
                    doomed.insert(change.number, reason);
                }
            }
        }

        let passed: HashSet<u64> = records
            .values()
            .filter(|r| r.status == ClStatus::Passed)
            .map(|r| r.change)
            .collect();
        let partition = self.partitioner.partition(&ready, &passed).await?;

        // A failure dooms everything it must be tested with.
        let mut rejected: HashSet<u64> = HashSet::new();
        for txn in partition
            .transactions
            .iter()
            .chain(partition.blocked.iter().map(|(t, _)| t))
            .chain(partition.oversized.iter())
        {
            let Some((&culprit, reason)) = txn
                .changes
                .iter()
                .find_map(|c| doomed.get_key_value(&c.number))
            else {
                continue;
            };
            for change in &txn.changes {
                let message = match doomed.get(&change.number) {
                    Some(own) => own.clone(),
                    None => companion_message(culprit, reason),
                };
                self.reject(change, &message, &mut records, &mut rejected)
                    .await?;
            }
        }
        for txn in &partition.oversized {
            let message = oversized_message(txn.len(), self.config.max_txn_length);
            for change in &txn.changes {
                self.reject(change, &message, &mut records, &mut rejected)
                    .await?;
            }
        }
        report.rejected = {
            let mut r: Vec<u64> = rejected.iter().copied().collect();
            r.sort_unstable();
            r
        };
        for (txn, waiting_on) in &partition.blocked {
            if txn.changes.iter().any(|c| rejected.contains(&c.number)) {
                continue;
            }
            debug!(changes = ?txn.numbers(), waiting_on = ?waiting_on, "transaction blocked");
            report.blocked.push(txn.numbers());
        }

        let limit = self.last_cycle_launches + self.config.launch_derivative;
        let mut tree_open: Option<bool> = None;
        let mut launches = 0usize;

        for txn in &partition.transactions {
            if txn.changes.iter().any(|c| rejected.contains(&c.number)) {
                continue;
            }
            if txn.changes.iter().any(|c| status_of(&records, c).is_busy()) {
                report.busy.push(txn.numbers());
                continue;
            }
            if self.too_recent(txn, now) {
                report.delayed.push(txn.numbers());
                continue;
            }
            let open = match tree_open {
                Some(open) => open,
                None => {
                    let open = self.pool.tree_is_open().await?;
                    tree_open = Some(open);
                    open
                }
            };
            if !open {
                report.tree_closed = true;
                report.throttled.push(txn.numbers());
                continue;
            }
            if launches >= limit {
                info!(limit, changes = ?txn.numbers(), "launch limit reached for this cycle");
                report.throttled.push(txn.numbers());
                continue;
            }

            let job = match self.launcher.launch(&txn.changes).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(changes = ?txn.numbers(), error = %e, "launch failed");
                    continue;
                }
            };
            for change in &txn.changes {
                let updated = self
                    .pool
                    .set_status(CATEGORY, change.number, ClStatus::Launching)
                    .await?;
                records.insert(change.number, updated);
            }
            launches += 1;
            METRICS.inc_launches();
            obs::emit_transaction_launched(&job.to_string(), &txn.numbers());
            report.launched.push((job, txn.numbers()));
        }

        self.last_cycle_launches = launches;
        Ok(report)
    }

    fn process_timeouts(&self, record: &ClStatusRecord, now: DateTime<Utc>) -> Verdict {
        let age = now - record.updated_at;
        match record.status {
            ClStatus::Launching if age >= self.config.launch_timeout() => {
                if record.retry_exhausted() {
                    Verdict::Reject(launch_timeout_message(self.config.launch_timeout_mins))
                } else {
                    Verdict::Retry
                }
            }
            ClStatus::Inflight if age >= self.config.inflight_timeout() => {
                Verdict::Reject(inflight_timeout_message(self.config.inflight_timeout_mins))
            }
            ClStatus::Failed if record.retry_exhausted() => {
                Verdict::Reject(REPEATED_FAILURE_MESSAGE.to_string())
            }
            ClStatus::Failed => Verdict::Retry,
            _ => Verdict::Keep,
        }
    }

    fn too_recent(&self, txn: &Transaction, now: DateTime<Utc>) -> bool {
        let delay = self.config.launch_delay();
        txn.changes
            .iter()
            .filter_map(|c| c.approved_at)
            .any(|at| now - at < delay)
    }

    async fn reject(
        &self,
        change: &Change,
        message: &str,
        records: &mut HashMap<u64, ClStatusRecord>,
        rejected: &mut HashSet<u64>,
    ) -> Result<()> {
        if status_of(records, change) == ClStatus::Passed || !rejected.insert(change.number) {
            return Ok(());
        }
        self.pool.reject(CATEGORY, change, message).await?;
        if let Some(record) = records.get_mut(&change.number) {
            record.status = ClStatus::Failed;
        }
        Ok(())
    }
}

enum Verdict {
    Keep,
    Retry,
    Reject(String),
}

fn status_of(records: &HashMap<u64, ClStatusRecord>, change: &Change) -> ClStatus {
    records
        .get(&change.number)
        .map(|r| r.status)
        .unwrap_or(ClStatus::Waiting)
}
