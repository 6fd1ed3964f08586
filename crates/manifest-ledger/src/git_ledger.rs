//! Git-backed `LedgerStore`.
//!
//! Uses a local clone of the ledger repository. Reads go through
//! `git ls-tree`/`git cat-file` at a fixed commit so the working tree is
//! never touched. Writes build a commit on top of the base revision with a
//! throwaway index and push it; the remote refuses non-fast-forward pushes,
//! which surfaces as `StorageError::PushRejected`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::StorageError;
use crate::storage_traits::{
    validate_path, LedgerCommit, LedgerRevision, LedgerStore, StorageResult,
};

const REJECTION_MARKERS: [&str; 3] = ["[rejected]", "non-fast-forward", "fetch first"];

struct GitOutput {
    success: bool,
    stdout: Vec<u8>,
    stderr: String,
}

impl GitOutput {
    fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Ledger stored in a git branch, accessed through a local clone.
#[derive(Debug, Clone)]
pub struct GitLedger {
    workdir: PathBuf,
    remote: String,
    branch: String,
    author_name: String,
    author_email: String,
}

impl GitLedger {
    /// Create a ledger over the clone at `workdir`, tracking `remote`/`branch`.
    pub fn new(workdir: impl Into<PathBuf>, remote: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            remote: remote.into(),
            branch: branch.into(),
            author_name: "lkgm".to_string(),
            author_email: "lkgm@localhost".to_string(),
        }
    }

    /// Set the identity recorded on ledger commits.
    pub fn with_identity(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote, self.branch)
    }

    async fn git(
        &self,
        args: &[&str],
        index_file: Option<&Path>,
        stdin: Option<&[u8]>,
    ) -> StorageResult<GitOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_AUTHOR_NAME", &self.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.author_email)
            .env("GIT_COMMITTER_NAME", &self.author_name)
            .env("GIT_COMMITTER_EMAIL", &self.author_email)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(index) = index_file {
            cmd.env("GIT_INDEX_FILE", index);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| StorageError::Backend(format!("failed to run git: {e}")))?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
        }
        let output = child.wait_with_output().await?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn git_ok(
        &self,
        args: &[&str],
        index_file: Option<&Path>,
        stdin: Option<&[u8]>,
    ) -> StorageResult<GitOutput> {
        let output = self.git(args, index_file, stdin).await?;
        if !output.success {
            return Err(StorageError::Backend(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                output.stderr
            )));
        }
        Ok(output)
    }

    /// `git ls-tree` entries as `(type, object, path)`.
    async fn ls_tree(&self, at: &LedgerRevision, path: &str) -> StorageResult<Vec<(String, String, String)>> {
        let output = self.git(&["ls-tree", at.as_str(), "--", path], None, None).await?;
        if !output.success {
            if output.stderr.contains("Not a valid object name") {
                return Err(StorageError::UnknownRevision {
                    revision: at.to_string(),
                });
            }
            return Err(StorageError::Backend(format!(
                "git ls-tree failed: {}",
                output.stderr
            )));
        }

        let listing = String::from_utf8_lossy(&output.stdout).into_owned();
        let entries = listing
            .lines()
            .filter_map(|line| {
                let (meta, path) = line.split_once('\t')?;
                let mut parts = meta.split_whitespace();
                let _mode = parts.next()?;
                let kind = parts.next()?;
                let object = parts.next()?;
                Some((kind.to_string(), object.to_string(), path.to_string()))
            })
            .collect();
        Ok(entries)
    }
}

#[async_trait]
impl LedgerStore for GitLedger {
    #[instrument(skip(self), fields(remote = %self.remote, branch = %self.branch))]
    async fn fetch_tip(&self) -> StorageResult<LedgerRevision> {
        let refspec = format!("+refs/heads/{}:{}", self.branch, self.tracking_ref());
        let fetch = self
            .git(&["fetch", "--quiet", &self.remote, &refspec], None, None)
            .await?;
        if !fetch.success {
            return Err(StorageError::Unreachable {
                detail: fetch.stderr,
            });
        }

        let rev_arg = format!("{}^{{commit}}", self.tracking_ref());
        let output = self
            .git_ok(&["rev-parse", "--verify", &rev_arg], None, None)
            .await?;
        let tip = output.stdout_trimmed();
        debug!(tip = %tip, "fetched ledger tip");
        Ok(LedgerRevision(tip))
    }

    async fn read(&self, at: &LedgerRevision, path: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_path(path)?;
        let entries = self.ls_tree(at, path).await?;
        let Some((_, object, _)) = entries
            .into_iter()
            .find(|(kind, _, p)| kind == "blob" && p == path)
        else {
            return Ok(None);
        };
        let output = self
            .git_ok(&["cat-file", "blob", &object], None, None)
            .await?;
        Ok(Some(output.stdout))
    }

    async fn list(&self, at: &LedgerRevision, dir: &str) -> StorageResult<Vec<String>> {
        validate_path(dir)?;
        let prefix = format!("{dir}/");
        let entries = self.ls_tree(at, &prefix).await?;
        Ok(entries
            .into_iter()
            .filter(|(kind, _, _)| kind == "blob")
            .filter_map(|(_, _, path)| path.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    #[instrument(skip(self, commit), fields(base = %base, writes = commit.writes.len()))]
    async fn commit(
        &self,
        base: &LedgerRevision,
        commit: LedgerCommit,
    ) -> StorageResult<LedgerRevision> {
        for write in &commit.writes {
            validate_path(&write.path)?;
        }

        let scratch = tempfile::tempdir()?;
        let index = scratch.path().join("index");
        self.git_ok(&["read-tree", base.as_str()], Some(&index), None)
            .await?;

        for write in &commit.writes {
            let blob = self
                .git_ok(&["hash-object", "-w", "--stdin"], None, Some(&write.contents))
                .await?
                .stdout_trimmed();
            let cacheinfo = format!("100644,{},{}", blob, write.path);
            self.git_ok(
                &["update-index", "--add", "--cacheinfo", &cacheinfo],
                Some(&index),
                None,
            )
            .await?;
        }

        let tree = self
            .git_ok(&["write-tree"], Some(&index), None)
            .await?
            .stdout_trimmed();
        let new_commit = self
            .git_ok(
                &["commit-tree", &tree, "-p", base.as_str(), "-m", &commit.message],
                None,
                None,
            )
            .await?
            .stdout_trimmed();

        let refspec = format!("{}:refs/heads/{}", new_commit, self.branch);
        let push = self
            .git(&["push", "--porcelain", &self.remote, &refspec], None, None)
            .await?;
        if !push.success {
            let stdout = String::from_utf8_lossy(&push.stdout);
            let rejected = REJECTION_MARKERS
                .iter()
                .any(|m| push.stderr.contains(m) || stdout.contains(m));
            if rejected {
                warn!(base = %base, "ledger push rejected");
                return Err(StorageError::PushRejected {
                    base: base.to_string(),
                });
            }
            return Err(StorageError::Unreachable {
                detail: push.stderr,
            });
        }

        self.git_ok(&["update-ref", &self.tracking_ref(), &new_commit], None, None)
            .await?;
        Ok(LedgerRevision(new_commit))
    }
}
