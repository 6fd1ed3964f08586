//! Candidate version numbers.
//!
//! A version is `major.minor.patch-rcN`. The first three parts come from the
//! source tree's version file; `N` (the revision) is bumped every time a new
//! candidate is cut for the same base. Revision 0 renders without a suffix.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::error::{LkgmError, Result};

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)\.(\d+)\.(\d+)(?:-rc(\d+))?$").expect("valid version regex")
    })
}

fn assignment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^\s*(?:export\s+)?([A-Z_]+)\s*=\s*"?(\d+)"?\s*$"#)
            .expect("valid assignment regex")
    })
}

/// Immutable four-part candidate version.
///
/// Field order is the comparison order, so the derived `Ord` is the
/// lexicographic tuple order `(major, minor, patch, revision)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    major: u32,
    minor: u32,
    patch: u32,
    revision: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            revision,
        }
    }

    /// Parse `41.0.0` or `41.0.0-rc3`.
    pub fn parse(input: &str) -> Result<Self> {
        let caps = version_pattern()
            .captures(input.trim())
            .ok_or_else(|| LkgmError::Parse {
                input: input.to_string(),
                reason: "expected MAJOR.MINOR.PATCH[-rcN]".to_string(),
            })?;
        let part = |i: usize| -> Result<u32> {
            match caps.get(i) {
                None => Ok(0),
                Some(m) => m.as_str().parse().map_err(|e| LkgmError::Parse {
                    input: input.to_string(),
                    reason: format!("component {i}: {e}"),
                }),
            }
        };
        Ok(Self::new(part(1)?, part(2)?, part(3)?, part(4)?))
    }

    /// Parse a candidate file name such as `41.0.0-rc3.xml`.
    pub fn from_file_name(name: &str) -> Result<Self> {
        let stem = name.strip_suffix(".xml").ok_or_else(|| LkgmError::Parse {
            input: name.to_string(),
            reason: "candidate files end in .xml".to_string(),
        })?;
        Self::parse(stem)
    }

    /// Read the base version from a shell-style version file.
    ///
    /// Recognises `MAJOR=`, `MINOR=`, `PATCH=` (optionally `export`ed or
    /// quoted); the revision of the result is always 0.
    pub fn from_version_file(contents: &str) -> Result<Self> {
        let mut major = None;
        let mut minor = None;
        let mut patch = None;
        for line in contents.lines() {
            let Some(caps) = assignment_pattern().captures(line) else {
                continue;
            };
            let value: u32 = caps[2].parse().map_err(|e| LkgmError::Parse {
                input: line.to_string(),
                reason: format!("{e}"),
            })?;
            match &caps[1] {
                "MAJOR" => major = Some(value),
                "MINOR" => minor = Some(value),
                "PATCH" => patch = Some(value),
                _ => {}
            }
        }
        match (major, minor, patch) {
            (Some(major), Some(minor), Some(patch)) => Ok(Self::new(major, minor, patch, 0)),
            _ => Err(LkgmError::Parse {
                input: contents.to_string(),
                reason: "version file must define MAJOR, MINOR and PATCH".to_string(),
            }),
        }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn patch(&self) -> u32 {
        self.patch
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// The same version with revision 0.
    pub fn base(&self) -> Self {
        Self::new(self.major, self.minor, self.patch, 0)
    }

    /// A new version with `revision + 1`; all other parts unchanged.
    ///
    /// Fails on a revision already at `u32::MAX`.
    pub fn increment_revision(&self) -> Result<Self> {
        let revision = self
            .revision
            .checked_add(1)
            .ok_or_else(|| LkgmError::RevisionExhausted {
                version: self.to_string(),
            })?;
        Ok(Self::new(self.major, self.minor, self.patch, revision))
    }

    /// Canonical candidate file name, e.g. `41.0.0-rc3.xml`.
    pub fn file_name(&self) -> String {
        format!("{self}.xml")
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.revision > 0 {
            write!(f, "-rc{}", self.revision)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = LkgmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = LkgmError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn parse_round_trips_through_display() {
        for s in ["41.0.0", "41.0.0-rc3", "7072.12.5-rc14", "0.0.0-rc1"] {
            let parsed = v(s);
            assert_eq!(v(&parsed.to_string()), parsed, "{s}");
        }
        assert_eq!(v("41.0.0-rc0"), v("41.0.0"));
    }

    #[test]
    fn malformed_versions_fail() {
        for s in ["", "41", "41.0", "41.0.0-rc", "41.0.0-beta1", "a.b.c", "41.0.0.1"] {
            assert!(
                matches!(Version::parse(s), Err(LkgmError::Parse { .. })),
                "{s} should not parse"
            );
        }
    }

    #[test]
    fn ordering_is_lexicographic_by_component() {
        assert!(v("41.0.0-rc2") < v("41.0.0-rc3"));
        assert!(v("41.0.0-rc9") < v("41.0.0-rc10"));
        assert!(v("41.0.0-rc99") < v("41.0.1"));
        assert!(v("41.9.9-rc9") < v("42.0.0"));
        assert_eq!(v("41.0.0-rc3").cmp(&v("41.0.0-rc3")), std::cmp::Ordering::Equal);
    }

    #[test]
    fn increment_revision_is_strictly_greater() {
        let base = v("41.0.0");
        let next = base.increment_revision().unwrap();
        assert!(next > base);
        assert_eq!(next.to_string(), "41.0.0-rc1");
        assert_eq!(next.base(), base);
        assert_eq!(v("41.0.0-rc3").increment_revision().unwrap(), v("41.0.0-rc4"));
    }

    #[test]
    fn increment_at_max_revision_is_an_error() {
        let last = v("41.0.0-rc4294967295");
        assert_eq!(last.revision(), u32::MAX);
        assert!(matches!(
            last.increment_revision(),
            Err(LkgmError::RevisionExhausted { .. })
        ));
        assert_eq!(
            v("41.0.0-rc4294967294").increment_revision().unwrap(),
            last
        );
        assert!(Version::parse("41.0.0-rc4294967296").is_err());
    }

    #[test]
    fn file_name_round_trip() {
        let version = v("41.0.0-rc3");
        assert_eq!(version.file_name(), "41.0.0-rc3.xml");
        assert_eq!(Version::from_file_name("41.0.0-rc3.xml").unwrap(), version);
        assert!(Version::from_file_name("41.0.0-rc3.json").is_err());
    }

    #[test]
    fn version_file_parsing() {
        let contents = r#"
#!/bin/sh
# version of the source tree
MAJOR=41
export MINOR="0"
PATCH=2
UNRELATED=9
"#;
        assert_eq!(Version::from_version_file(contents).unwrap(), v("41.0.2"));
        assert!(Version::from_version_file("MAJOR=1\nMINOR=2\n").is_err());
    }

    #[test]
    fn serde_uses_display_form() {
        let json = serde_json::to_string(&v("41.0.0-rc3")).unwrap();
        assert_eq!(json, "\"41.0.0-rc3\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v("41.0.0-rc3"));
        assert!(serde_json::from_str::<Version>("\"garbage\"").is_err());
    }

    use proptest::prelude::*;

    fn arb_version() -> impl Strategy<Value = Version> {
        let revision = prop_oneof![0..4u32, any::<u32>(), Just(u32::MAX)];
        (0..50u32, 0..5u32, 0..5u32, revision)
            .prop_map(|(major, minor, patch, revision)| Version::new(major, minor, patch, revision))
    }

    proptest! {
        #[test]
        fn display_parses_back_to_the_same_version(version in arb_version()) {
            prop_assert_eq!(Version::parse(&version.to_string()).unwrap(), version);
            prop_assert_eq!(Version::from_file_name(&version.file_name()).unwrap(), version);
        }

        #[test]
        fn ordering_is_transitive(a in arb_version(), b in arb_version(), c in arb_version()) {
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
            if a < b && b < c {
                prop_assert!(a < c);
            }
        }

        #[test]
        fn increment_is_strictly_greater_or_exhausted(version in arb_version()) {
            match version.increment_revision() {
                Ok(next) => {
                    prop_assert!(next > version);
                    prop_assert_eq!(next.base(), version.base());
                    prop_assert_eq!(next.revision(), version.revision() + 1);
                }
                Err(e) => {
                    prop_assert_eq!(version.revision(), u32::MAX);
                    prop_assert!(matches!(e, LkgmError::RevisionExhausted { .. }), "expected LkgmError::RevisionExhausted");
                }
            }
        }
    }
}
