//! Change-lists as seen by the coordination core.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A reviewable unit of source modification.
///
/// `number` is the review system's numeric identifier and the key every
/// status record is stored under. `change_id` is the stable id carried in
/// the commit message; it may be missing on legacy changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub number: u64,
    pub change_id: Option<String>,
    pub project: String,
    pub branch: String,
    pub commit: String,
    pub approved_at: Option<DateTime<Utc>>,
}

impl Change {
    pub fn new(number: u64, project: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            number,
            change_id: None,
            project: project.into(),
            branch: "main".to_string(),
            commit: commit.into(),
            approved_at: None,
        }
    }

    pub fn with_change_id(mut self, change_id: impl Into<String>) -> Self {
        self.change_id = Some(change_id.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn approved_at(mut self, at: DateTime<Utc>) -> Self {
        self.approved_at = Some(at);
        self
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CL:{}", self.number)
    }
}

/// One commit in a repository's history, as reported by the repository client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub subject: String,
    pub change_id: Option<String>,
    pub review_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_review_number() {
        let change = Change::new(4242, "platform/ec", "abc").with_change_id("I42");
        assert_eq!(change.to_string(), "CL:4242");
        assert_eq!(change.change_id.as_deref(), Some("I42"));
        assert_eq!(change.branch, "main");
    }
}
