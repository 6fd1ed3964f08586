//! Builder and CL status records.
//!
//! Both are stored as JSON documents in the ledger. Builder statuses are
//! keyed by (builder, version) and CL statuses by (category, change number),
//! so concurrent writers never touch the same file.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::{LkgmError, Result};
use crate::domain::Version;

/// Outcome of one builder for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Missing,
    Inflight,
    Passed,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Passed | BuildStatus::Failed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildStatus::Missing => "missing",
            BuildStatus::Inflight => "inflight",
            BuildStatus::Passed => "passed",
            BuildStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderStatusRecord {
    pub builder_name: String,
    pub version: Version,
    pub status: BuildStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Which tier a CL status belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClCategory {
    CommitQueue,
    PreSubmission,
}

impl ClCategory {
    pub fn dir(&self) -> &'static str {
        match self {
            ClCategory::CommitQueue => "commit-queue",
            ClCategory::PreSubmission => "pre-submission",
        }
    }
}

impl fmt::Display for ClCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

/// Per-change lifecycle: waiting → launching → inflight → passed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClStatus {
    Waiting,
    Launching,
    Inflight,
    Passed,
    Failed,
}

impl ClStatus {
    /// Statuses that mean a job currently owns the change.
    pub fn is_busy(&self) -> bool {
        matches!(self, ClStatus::Launching | ClStatus::Inflight)
    }
}

impl fmt::Display for ClStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClStatus::Waiting => "waiting",
            ClStatus::Launching => "launching",
            ClStatus::Inflight => "inflight",
            ClStatus::Passed => "passed",
            ClStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClStatusRecord {
    pub category: ClCategory,
    pub change: u64,
    pub status: ClStatus,
    pub updated_at: DateTime<Utc>,
    /// Set once the change has used its single return to `waiting`.
    #[serde(default)]
    pub retried: bool,
}

impl ClStatusRecord {
    /// The implicit record of a change nobody has touched yet.
    pub fn initial(category: ClCategory, change: u64, now: DateTime<Utc>) -> Self {
        Self {
            category,
            change,
            status: ClStatus::Waiting,
            updated_at: now,
            retried: false,
        }
    }

    /// Whether a failure from here would be final.
    pub fn retry_exhausted(&self) -> bool {
        self.retried
    }

    /// Compute the record after moving to `to`.
    ///
    /// Setting the current status again returns the record unchanged, so
    /// the timestamp a timeout is measured from is not reset. Going back to
    /// `waiting` (from `launching` or `failed`) is allowed once per change.
    pub fn transition(&self, to: ClStatus, now: DateTime<Utc>) -> Result<Self> {
        use ClStatus::*;

        if self.status == to {
            return Ok(self.clone());
        }
        let allowed = match (self.status, to) {
            (Waiting, Launching) | (Waiting, Failed) => true,
            (Launching, Inflight) | (Launching, Failed) => true,
            (Inflight, Passed) | (Inflight, Failed) => true,
            // One retry per change, shared by launch timeouts and failures: a
            // change relaunched after failing is rejected on its next timeout.
            (Launching, Waiting) | (Failed, Waiting) => !self.retried,
            _ => false,
        };
        if !allowed {
            return Err(LkgmError::InvalidTransition {
                change: self.change,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(Self {
            status: to,
            updated_at: now,
            retried: self.retried || to == Waiting,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
    }

    fn record() -> ClStatusRecord {
        ClStatusRecord::initial(ClCategory::PreSubmission, 7, t(0))
    }

    #[test]
    fn happy_path_transitions() {
        let r = record().transition(ClStatus::Launching, t(1)).unwrap();
        let r = r.transition(ClStatus::Inflight, t(2)).unwrap();
        let r = r.transition(ClStatus::Passed, t(3)).unwrap();
        assert_eq!(r.status, ClStatus::Passed);
        assert_eq!(r.updated_at, t(3));
        assert!(!r.retried);
    }

    #[test]
    fn failed_returns_to_waiting_at_most_once() {
        let r = record()
            .transition(ClStatus::Launching, t(1))
            .and_then(|r| r.transition(ClStatus::Failed, t(2)))
            .unwrap();
        let r = r.transition(ClStatus::Waiting, t(3)).unwrap();
        assert!(r.retried);

        let r = r
            .transition(ClStatus::Launching, t(4))
            .and_then(|r| r.transition(ClStatus::Failed, t(5)))
            .unwrap();
        assert!(matches!(
            r.transition(ClStatus::Waiting, t(6)),
            Err(LkgmError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn launch_timeout_retry_consumes_the_single_retry() {
        let r = record()
            .transition(ClStatus::Launching, t(1))
            .and_then(|r| r.transition(ClStatus::Waiting, t(2)))
            .and_then(|r| r.transition(ClStatus::Launching, t(3)))
            .and_then(|r| r.transition(ClStatus::Failed, t(4)))
            .unwrap();
        assert!(r.retry_exhausted());
        assert!(r.transition(ClStatus::Waiting, t(5)).is_err());
    }

    #[test]
    fn relaunch_after_failure_has_no_launch_retry_left() {
        let r = record()
            .transition(ClStatus::Failed, t(1))
            .and_then(|r| r.transition(ClStatus::Waiting, t(2)))
            .and_then(|r| r.transition(ClStatus::Launching, t(3)))
            .unwrap();
        assert!(r.retry_exhausted());
        assert!(matches!(
            r.transition(ClStatus::Waiting, t(4)),
            Err(LkgmError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn passed_is_absorbing() {
        let passed = record()
            .transition(ClStatus::Launching, t(1))
            .and_then(|r| r.transition(ClStatus::Inflight, t(2)))
            .and_then(|r| r.transition(ClStatus::Passed, t(3)))
            .unwrap();
        for to in [
            ClStatus::Waiting,
            ClStatus::Launching,
            ClStatus::Inflight,
            ClStatus::Failed,
        ] {
            assert!(passed.transition(to, t(4)).is_err(), "passed -> {to}");
        }
    }

    #[test]
    fn same_status_keeps_timestamp() {
        let r = record().transition(ClStatus::Launching, t(1)).unwrap();
        let again = r.transition(ClStatus::Launching, t(9)).unwrap();
        assert_eq!(again.updated_at, t(1));
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(record().transition(ClStatus::Inflight, t(1)).is_err());
        assert!(record().transition(ClStatus::Passed, t(1)).is_err());
    }

    #[test]
    fn builder_status_serializes_snake_case() {
        let rec = BuilderStatusRecord {
            builder_name: "amd64-generic-paladin".into(),
            version: Version::parse("41.0.0-rc1").unwrap(),
            status: BuildStatus::Inflight,
            timestamp: t(0),
            message: None,
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"status\":\"inflight\""));
        assert!(json.contains("\"version\":\"41.0.0-rc1\""));
        let back: BuilderStatusRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
