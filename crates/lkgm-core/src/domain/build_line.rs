//! Build lines: independent candidate sequences, one ledger directory each.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::error::{LkgmError, Result};

/// A build line owns one directory of candidate files in the ledger, so
/// versions cut for one line never collide with another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildLine {
    PreFlightQueue,
    ChromePreFlightQueue,
    CommitQueue,
}

impl BuildLine {
    pub const ALL: [BuildLine; 3] = [
        BuildLine::PreFlightQueue,
        BuildLine::ChromePreFlightQueue,
        BuildLine::CommitQueue,
    ];

    /// Ledger directory holding this line's candidates.
    pub fn dir(&self) -> &'static str {
        match self {
            BuildLine::PreFlightQueue => "pre-flight-queue",
            BuildLine::ChromePreFlightQueue => "chrome-pre-flight-queue",
            BuildLine::CommitQueue => "commit-queue",
        }
    }

    /// Ledger path of the candidate file for `version` on this line.
    pub fn candidate_path(&self, version: &crate::domain::Version) -> String {
        format!("{}/{}", self.dir(), version.file_name())
    }
}

impl fmt::Display for BuildLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

impl FromStr for BuildLine {
    type Err = LkgmError;

    fn from_str(s: &str) -> Result<Self> {
        BuildLine::ALL
            .into_iter()
            .find(|line| line.dir() == s)
            .ok_or_else(|| LkgmError::Config(format!("unknown build line '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Version;

    #[test]
    fn lines_have_distinct_directories() {
        let dirs: std::collections::HashSet<_> = BuildLine::ALL.iter().map(|l| l.dir()).collect();
        assert_eq!(dirs.len(), BuildLine::ALL.len());
    }

    #[test]
    fn candidate_path_is_canonical() {
        let v = Version::parse("41.0.0-rc3").unwrap();
        assert_eq!(
            BuildLine::CommitQueue.candidate_path(&v),
            "commit-queue/41.0.0-rc3.xml"
        );
    }

    #[test]
    fn from_str_accepts_directory_names() {
        assert_eq!(
            "chrome-pre-flight-queue".parse::<BuildLine>().unwrap(),
            BuildLine::ChromePreFlightQueue
        );
        assert!("nightly".parse::<BuildLine>().is_err());
    }
}
