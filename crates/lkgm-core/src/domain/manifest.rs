//! Candidate manifest documents.
//!
//! A manifest pins every constituent repository to a revision and may carry
//! pending-commit entries for changes applied on top of the pinned state.
//! Manifests are rendered to a small, deterministic XML dialect:
//!
//! ```text
//! <?xml version="1.0" encoding="UTF-8"?>
//! <manifest>
//!   <remote name="cros" fetch="https://example.org"/>
//!   <default remote="cros" revision="refs/heads/main"/>
//!   <project name="platform/ec" path="src/platform/ec" remote="cros" revision="abc123"/>
//!   <pending_commit project="platform/ec" change_id="I1234" commit="def456"/>
//! </manifest>
//! ```
//!
//! Rendering preserves element order, so render → parse → render is
//! byte-stable.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use manifest_ledger::ContentDigest;
use serde::{Deserialize, Serialize};

use crate::domain::error::{LkgmError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    pub fetch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRemote {
    pub remote: String,
    pub revision: String,
}

/// One constituent repository pinned to a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub path: String,
    pub remote: Option<String>,
    pub revision: String,
}

impl Project {
    /// A project checked out at a path equal to its name.
    pub fn new(name: impl Into<String>, revision: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: name.clone(),
            name,
            remote: None,
            revision: revision.into(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }
}

/// A change applied on top of the pinned state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommit {
    pub project: String,
    pub change_id: Option<String>,
    pub commit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub remotes: Vec<Remote>,
    pub default: Option<DefaultRemote>,
    pub projects: Vec<Project>,
    pub pending_commits: Vec<PendingCommit>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote(mut self, name: impl Into<String>, fetch: impl Into<String>) -> Self {
        self.remotes.push(Remote {
            name: name.into(),
            fetch: fetch.into(),
        });
        self
    }

    pub fn with_default(mut self, remote: impl Into<String>, revision: impl Into<String>) -> Self {
        self.default = Some(DefaultRemote {
            remote: remote.into(),
            revision: revision.into(),
        });
        self
    }

    pub fn with_project(mut self, project: Project) -> Self {
        self.projects.push(project);
        self
    }

    pub fn with_pending_commit(mut self, commit: PendingCommit) -> Self {
        self.pending_commits.push(commit);
        self
    }

    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// The remote a project resolves to: its own, else the default.
    pub fn effective_remote<'a>(&'a self, project: &'a Project) -> Option<&'a str> {
        project
            .remote
            .as_deref()
            .or_else(|| self.default.as_ref().map(|d| d.remote.as_str()))
    }

    /// Digest of the pinned project set only.
    ///
    /// Two manifests with the same digest build the same sources; pending
    /// commits and remote declarations do not participate.
    pub fn project_digest(&self) -> ContentDigest {
        let mut canonical = String::new();
        for p in &self.projects {
            let _ = writeln!(
                canonical,
                "{}\t{}\t{}\t{}",
                p.name,
                p.path,
                self.effective_remote(p).unwrap_or(""),
                p.revision
            );
        }
        ContentDigest::from_bytes(canonical.as_bytes())
    }

    /// Keep only projects whose remote is allow-listed.
    ///
    /// Remote declarations that are not allowed are dropped, as are pending
    /// commits whose project did not survive, and the default when its remote
    /// is not allowed. Filtering a filtered manifest is a no-op.
    pub fn filtered(&self, allowed: &BTreeSet<String>) -> Result<Manifest> {
        let mut projects = Vec::with_capacity(self.projects.len());
        for project in &self.projects {
            let remote = self
                .effective_remote(project)
                .ok_or_else(|| LkgmError::Filter {
                    project: project.name.clone(),
                })?;
            if allowed.contains(remote) {
                projects.push(project.clone());
            }
        }
        let kept: BTreeSet<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        let pending_commits = self
            .pending_commits
            .iter()
            .filter(|c| kept.contains(c.project.as_str()))
            .cloned()
            .collect();
        let remotes = self
            .remotes
            .iter()
            .filter(|r| allowed.contains(&r.name))
            .cloned()
            .collect();

        // Projects that fell back on a disallowed default are already gone.
        let default = self
            .default
            .as_ref()
            .filter(|d| allowed.contains(&d.remote))
            .cloned();

        Ok(Manifest {
            remotes,
            default,
            projects,
            pending_commits,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<manifest>\n");
        for r in &self.remotes {
            element(&mut out, "remote", &[("name", Some(&r.name)), ("fetch", Some(&r.fetch))]);
        }
        if let Some(d) = &self.default {
            element(
                &mut out,
                "default",
                &[("remote", Some(&d.remote)), ("revision", Some(&d.revision))],
            );
        }
        for p in &self.projects {
            element(
                &mut out,
                "project",
                &[
                    ("name", Some(&p.name)),
                    ("path", Some(&p.path)),
                    ("remote", p.remote.as_ref()),
                    ("revision", Some(&p.revision)),
                ],
            );
        }
        for c in &self.pending_commits {
            element(
                &mut out,
                "pending_commit",
                &[
                    ("project", Some(&c.project)),
                    ("change_id", c.change_id.as_ref()),
                    ("commit", Some(&c.commit)),
                ],
            );
        }
        out.push_str("</manifest>\n");
        out
    }

    pub fn parse(input: &str) -> Result<Manifest> {
        let mut manifest = Manifest::new();
        let mut saw_root = false;
        let mut closed = false;
        let mut rest = input;

        loop {
            let Some(open) = rest.find('<') else {
                ensure_blank(rest)?;
                break;
            };
            ensure_blank(&rest[..open])?;
            rest = &rest[open..];

            if let Some(after) = rest.strip_prefix("<!--") {
                let end = after
                    .find("-->")
                    .ok_or_else(|| LkgmError::Manifest("unterminated comment".into()))?;
                rest = &after[end + 3..];
                continue;
            }
            let close = rest
                .find('>')
                .ok_or_else(|| LkgmError::Manifest("unterminated tag".into()))?;
            let tag = &rest[1..close];
            rest = &rest[close + 1..];

            if tag.starts_with('?') {
                continue;
            }
            if closed {
                return Err(LkgmError::Manifest("content after </manifest>".into()));
            }
            if tag.trim() == "/manifest" {
                if !saw_root {
                    return Err(LkgmError::Manifest("</manifest> without <manifest>".into()));
                }
                closed = true;
                continue;
            }
            let (name, attrs) = parse_tag(tag)?;
            if name == "manifest" {
                if saw_root {
                    return Err(LkgmError::Manifest("nested <manifest>".into()));
                }
                saw_root = true;
                continue;
            }
            if !saw_root {
                return Err(LkgmError::Manifest(format!("<{name}> outside <manifest>")));
            }
            manifest.push_element(&name, attrs)?;
        }

        if !saw_root || !closed {
            return Err(LkgmError::Manifest("missing <manifest> root".into()));
        }
        Ok(manifest)
    }

    fn push_element(&mut self, name: &str, mut attrs: Attributes) -> Result<()> {
        match name {
            "remote" => self.remotes.push(Remote {
                name: attrs.required("remote", "name")?,
                fetch: attrs.take("fetch").unwrap_or_default(),
            }),
            "default" => {
                self.default = Some(DefaultRemote {
                    remote: attrs.required("default", "remote")?,
                    revision: attrs.take("revision").unwrap_or_default(),
                })
            }
            "project" => {
                let name = attrs.required("project", "name")?;
                self.projects.push(Project {
                    path: attrs.take("path").unwrap_or_else(|| name.clone()),
                    remote: attrs.take("remote"),
                    revision: attrs.required("project", "revision")?,
                    name,
                })
            }
            "pending_commit" => self.pending_commits.push(PendingCommit {
                project: attrs.required("pending_commit", "project")?,
                change_id: attrs.take("change_id"),
                commit: attrs.required("pending_commit", "commit")?,
            }),
            other => tracing::debug!(element = %other, "ignoring unknown manifest element"),
        }
        Ok(())
    }
}

fn element(out: &mut String, name: &str, attrs: &[(&str, Option<&String>)]) {
    out.push_str("  <");
    out.push_str(name);
    for (key, value) in attrs {
        if let Some(value) = value {
            let _ = write!(out, " {key}=\"{}\"", escape(value));
        }
    }
    out.push_str("/>\n");
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let semi = rest[amp..]
            .find(';')
            .ok_or_else(|| LkgmError::Manifest(format!("bad entity in '{value}'")))?;
        let entity = &rest[amp + 1..amp + semi];
        out.push(match entity {
            "amp" => '&',
            "lt" => '<',
            "gt" => '>',
            "quot" => '"',
            "apos" => '\'',
            other => return Err(LkgmError::Manifest(format!("unknown entity &{other};"))),
        });
        rest = &rest[amp + semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn ensure_blank(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        Ok(())
    } else {
        Err(LkgmError::Manifest(format!(
            "unexpected text '{}'",
            text.trim()
        )))
    }
}

struct Attributes(Vec<(String, String)>);

impl Attributes {
    fn take(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    fn required(&mut self, element: &str, key: &str) -> Result<String> {
        self.take(key)
            .ok_or_else(|| LkgmError::Manifest(format!("<{element}> requires '{key}'")))
    }
}

fn parse_tag(tag: &str) -> Result<(String, Attributes)> {
    let body = tag.trim();
    let body = body.strip_suffix('/').unwrap_or(body).trim_end();
    let name_end = body
        .find(|c: char| c.is_whitespace())
        .unwrap_or(body.len());
    let name = &body[..name_end];
    if name.is_empty() {
        return Err(LkgmError::Manifest("empty tag".into()));
    }

    let mut attrs = Vec::new();
    let mut rest = body[name_end..].trim_start();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| LkgmError::Manifest(format!("attribute without value in <{name}>")))?;
        let key = rest[..eq].trim().to_string();
        let after = rest[eq + 1..].trim_start();
        let quote = after
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| LkgmError::Manifest(format!("unquoted attribute '{key}'")))?;
        let value_end = after[1..]
            .find(quote)
            .ok_or_else(|| LkgmError::Manifest(format!("unterminated attribute '{key}'")))?;
        attrs.push((key, unescape(&after[1..1 + value_end])?));
        rest = after[value_end + 2..].trim_start();
    }
    Ok((name.to_string(), Attributes(attrs)))
}
