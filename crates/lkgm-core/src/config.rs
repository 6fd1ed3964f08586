//! Agent configuration.
//!
//! Loaded from a TOML file (every field has a default) and then overridden
//! from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `LKGM_LEDGER_DIR` | `ledger.workdir` |
//! | `LKGM_LEDGER_REMOTE` | `ledger.remote` |
//! | `LKGM_LEDGER_BRANCH` | `ledger.branch` |
//! | `LKGM_RETRIES` | `retries` |
//! | `LKGM_ALLOWED_REMOTES` | `allowed_remotes` (comma separated) |

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::{LkgmError, Result};
use crate::poll::PollConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LkgmConfig {
    pub ledger: LedgerConfig,
    /// Attempts for every push-retry loop against the ledger.
    pub retries: u32,
    pub poll: PollSettings,
    /// Remotes that survive filtering for the secondary ledger.
    pub allowed_remotes: Vec<String>,
    pub presubmit: PresubmitConfig,
}

impl Default for LkgmConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            retries: 5,
            poll: PollSettings::default(),
            allowed_remotes: vec!["cros".to_string()],
            presubmit: PresubmitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub workdir: PathBuf,
    pub remote: String,
    pub branch: String,
    pub author_name: String,
    pub author_email: String,
    /// Fixed path of the promoted-baseline pointer.
    pub baseline_path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("manifest-versions"),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            author_name: "lkgm".to_string(),
            author_email: "lkgm@localhost".to_string(),
            baseline_path: "LKGM/lkgm.xml".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_secs: u64,
    pub short_timeout_secs: u64,
    pub long_timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            short_timeout_secs: 5 * 60,
            long_timeout_secs: 20 * 60,
        }
    }
}

impl PollSettings {
    /// Quick confirmation loops.
    pub fn short(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_secs(self.interval_secs),
            Duration::from_secs(self.short_timeout_secs),
        )
    }

    /// Waiting for candidates or for every builder to report.
    pub fn long(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_secs(self.interval_secs),
            Duration::from_secs(self.long_timeout_secs),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresubmitConfig {
    pub launch_timeout_mins: i64,
    pub inflight_timeout_mins: i64,
    /// Changes approved more recently than this are not launched yet.
    pub launch_delay_mins: i64,
    pub max_txn_length: usize,
    /// Each cycle may launch this many more jobs than the previous one.
    pub launch_derivative: usize,
    pub ready_query: String,
}

impl Default for PresubmitConfig {
    fn default() -> Self {
        Self {
            launch_timeout_mins: 90,
            inflight_timeout_mins: 240,
            launch_delay_mins: 2,
            max_txn_length: 50,
            launch_derivative: 20,
            ready_query: "status:open label:Commit-Queue>=1".to_string(),
        }
    }
}

impl PresubmitConfig {
    pub fn launch_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.launch_timeout_mins)
    }

    pub fn inflight_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.inflight_timeout_mins)
    }

    pub fn launch_delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.launch_delay_mins)
    }
}

impl LkgmConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| LkgmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given (a missing file is an error), apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    LkgmError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                toml::from_str(&text).map_err(|e| LkgmError::Config(e.to_string()))?
            }
            None => Self::default(),
        };
        let config = base.with_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup("LKGM_LEDGER_DIR") {
            self.ledger.workdir = PathBuf::from(dir);
        }
        if let Some(remote) = lookup("LKGM_LEDGER_REMOTE") {
            self.ledger.remote = remote;
        }
        if let Some(branch) = lookup("LKGM_LEDGER_BRANCH") {
            self.ledger.branch = branch;
        }
        if let Some(retries) = lookup("LKGM_RETRIES") {
            self.retries = retries
                .trim()
                .parse()
                .map_err(|e| LkgmError::Config(format!("LKGM_RETRIES='{retries}': {e}")))?;
        }
        if let Some(remotes) = lookup("LKGM_ALLOWED_REMOTES") {
            self.allowed_remotes = remotes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retries == 0 {
            return Err(LkgmError::Config("retries must be at least 1".into()));
        }
        if self.poll.interval_secs == 0 {
            return Err(LkgmError::Config("poll.interval_secs must be positive".into()));
        }
        if self.presubmit.max_txn_length == 0 {
            return Err(LkgmError::Config(
                "presubmit.max_txn_length must be at least 1".into(),
            ));
        }
        if self.presubmit.launch_timeout_mins <= 0 || self.presubmit.inflight_timeout_mins <= 0 {
            return Err(LkgmError::Config("presubmit timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn allowed_remote_set(&self) -> BTreeSet<String> {
        self.allowed_remotes.iter().cloned().collect()
    }
}
