//! Candidate lifecycle for one agent run.
//!
//! The master cuts candidates with [`CandidateManager::create_candidate`] and
//! later promotes them; slaves pick them up with
//! [`CandidateManager::get_latest_candidate`]. A secondary manager mirrors
//! the master's candidates, filtered, into another ledger with
//! [`CandidateManager::create_from_manifest`].

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{PatchProvider, RepositoryClient};
use crate::domain::{BuildLine, Change, LkgmError, Manifest, PendingCommit, Result, Version};
use crate::manifest_store::ManifestStore;
use crate::obs::CandidateSpan;
use crate::poll::{PollConfig, PollState};

/// Where the current run is in the candidate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerPhase {
    Idle,
    SourceCheckedOut,
    VersionResolved,
    ManifestBuilt,
    Patched,
    Published,
    Completed,
}

/// A candidate that exists in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedCandidate {
    pub line: BuildLine,
    pub version: Version,
    pub manifest: Manifest,
}

/// One commit between two candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlameEntry {
    pub project: String,
    pub commit: String,
    pub subject: String,
    pub change_id: Option<String>,
    pub review_url: Option<String>,
    /// Landed without going through review.
    pub chump: bool,
}

pub struct CandidateManager {
    store: ManifestStore,
    repo: Arc<dyn RepositoryClient>,
    patches: Option<Arc<dyn PatchProvider>>,
    line: BuildLine,
    poll: PollConfig,
    allowed_remotes: BTreeSet<String>,
    phase: ManagerPhase,
    current: Option<PublishedCandidate>,
    apply_failures: Vec<(Change, String)>,
}

impl CandidateManager {
    pub fn new(
        store: ManifestStore,
        repo: Arc<dyn RepositoryClient>,
        line: BuildLine,
        poll: PollConfig,
    ) -> Self {
        Self {
            store,
            repo,
            patches: None,
            line,
            poll,
            allowed_remotes: BTreeSet::new(),
            phase: ManagerPhase::Idle,
            current: None,
            apply_failures: Vec::new(),
        }
    }

    pub fn with_patch_provider(mut self, patches: Arc<dyn PatchProvider>) -> Self {
        self.patches = Some(patches);
        self
    }

    pub fn with_allowed_remotes(mut self, remotes: BTreeSet<String>) -> Self {
        self.allowed_remotes = remotes;
        self
    }

    pub fn line(&self) -> BuildLine {
        self.line
    }

    pub fn phase(&self) -> ManagerPhase {
        self.phase
    }

    pub fn current(&self) -> Option<&PublishedCandidate> {
        self.current.as_ref()
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ManifestStore {
        &mut self.store
    }

    /// Changes the last `create_candidate` could not apply, with the reason.
    pub fn apply_failures(&self) -> &[(Change, String)] {
        &self.apply_failures
    }

    fn advance(&mut self, phase: ManagerPhase) {
        debug!(from = ?self.phase, to = ?phase, "candidate phase");
        self.phase = phase;
    }

    /// Cut and publish a new candidate from the current source tree.
    ///
    /// `pending` changes are applied on top and recorded in the manifest;
    /// those that fail to apply are left out and reported through
    /// [`Self::apply_failures`]. Returns `None` when the snapshot matches
    /// the latest candidate and nothing was applied, unless `force` is set.
    #[instrument(skip(self, pending), fields(line = %self.line, pending = pending.len()))]
    pub async fn create_candidate(
        &mut self,
        pending: &[Change],
        force: bool,
    ) -> Result<Option<PublishedCandidate>> {
        self.advance(ManagerPhase::Idle);
        self.apply_failures.clear();

        self.repo.sync().await?;
        self.advance(ManagerPhase::SourceCheckedOut);

        self.store.refresh_checkout_with_retry().await?;
        let local = self.repo.read_version().await?;
        let latest = self.store.latest(self.line).await?;
        self.advance(ManagerPhase::VersionResolved);

        let mut manifest = self.repo.export_manifest().await?;
        self.advance(ManagerPhase::ManifestBuilt);

        let applied = self.apply_pending(pending, &mut manifest).await?;
        if !applied.is_empty() {
            self.advance(ManagerPhase::Patched);
        }

        if applied.is_empty() && !force {
            if let Some(latest) = latest {
                let unchanged = match self.store.read_candidate(self.line, &latest).await? {
                    Some(previous) => previous.project_digest() == manifest.project_digest(),
                    None => false,
                };
                if unchanged {
                    info!(latest = %latest, local = %local, "no changes since the latest candidate");
                    self.advance(ManagerPhase::Completed);
                    return Ok(None);
                }
            }
        }

        let version = self.store.publish(self.line, &manifest, &local).await?;
        {
            let _span = CandidateSpan::enter(self.line, &version);
            self.store.mark_processed(self.line, version);
            self.advance(ManagerPhase::Published);
            info!(applied = applied.len(), "candidate created");
        }

        let candidate = PublishedCandidate {
            line: self.line,
            version,
            manifest,
        };
        self.current = Some(candidate.clone());
        Ok(Some(candidate))
    }

    async fn apply_pending(&mut self, pending: &[Change], manifest: &mut Manifest) -> Result<Vec<Change>> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let patches = self.patches.clone().ok_or_else(|| LkgmError::PatchProvider {
            change: pending[0].number,
            detail: "no patch provider configured".to_string(),
        })?;

        let mut applied = Vec::new();
        for change in pending {
            match patches.apply(change).await {
                Ok(commit) => {
                    manifest.pending_commits.push(PendingCommit {
                        project: change.project.clone(),
                        change_id: change.change_id.clone(),
                        commit,
                    });
                    applied.push(change.clone());
                }
                Err(e) => {
                    warn!(change = change.number, error = %e, "change failed to apply");
                    self.apply_failures.push((change.clone(), e.to_string()));
                }
            }
        }
        Ok(applied)
    }

    /// Republish a filtered copy of `candidate` under the same version.
    #[instrument(skip(self, candidate), fields(line = %self.line, version = %candidate.version))]
    pub async fn create_from_manifest(
        &mut self,
        candidate: &PublishedCandidate,
    ) -> Result<PublishedCandidate> {
        self.advance(ManagerPhase::Idle);
        let filtered = candidate.manifest.filtered(&self.allowed_remotes)?;
        self.advance(ManagerPhase::ManifestBuilt);

        self.store
            .publish_exact(self.line, &candidate.version, &filtered)
            .await?;
        self.store.mark_processed(self.line, candidate.version);
        self.advance(ManagerPhase::Published);

        let mirrored = PublishedCandidate {
            line: self.line,
            version: candidate.version,
            manifest: filtered,
        };
        self.current = Some(mirrored.clone());
        Ok(mirrored)
    }

    /// Wait for a candidate this agent has not processed yet and check it
    /// out. Returns `None` once the poll timeout elapses.
    #[instrument(skip(self), fields(line = %self.line))]
    pub async fn get_latest_candidate(&mut self) -> Result<Option<PublishedCandidate>> {
        self.advance(ManagerPhase::Idle);
        let mut state = PollState::start(self.poll);
        let version = loop {
            match self.store.refresh_checkout().await {
                Ok(_) => {
                    if let Some(version) = self.store.latest_unprocessed(self.line).await? {
                        break version;
                    }
                }
                Err(e) => warn!(error = %e, "ledger refresh failed while waiting for a candidate"),
            }
            if !state.wait().await {
                info!(waited_secs = state.elapsed().as_secs(), "no new candidate found");
                return Ok(None);
            }
        };

        let manifest = self
            .store
            .read_candidate(self.line, &version)
            .await?
            .ok_or_else(|| LkgmError::Manifest(format!("{}/{} vanished", self.line, version)))?;
        self.repo.checkout(&manifest).await?;
        self.advance(ManagerPhase::SourceCheckedOut);
        self.store.mark_processed(self.line, version);
        self.advance(ManagerPhase::Published);
        info!(version = %version, "synced to candidate");

        let candidate = PublishedCandidate {
            line: self.line,
            version,
            manifest,
        };
        self.current = Some(candidate.clone());
        Ok(Some(candidate))
    }

    /// Make the current candidate the new baseline.
    #[instrument(skip(self), fields(line = %self.line))]
    pub async fn promote_candidate(&mut self) -> Result<()> {
        let version = self.current.as_ref().ok_or(LkgmError::NoCandidate)?.version;
        self.store.promote(self.line, &version).await?;
        self.advance(ManagerPhase::Completed);
        Ok(())
    }

    /// Commits in the current candidate that `previous` did not have.
    ///
    /// Projects missing from `previous` are skipped since they have no base
    /// revision to diff from.
    pub async fn blamelist(&self, previous: &Manifest) -> Result<Vec<BlameEntry>> {
        let current = self.current.as_ref().ok_or(LkgmError::NoCandidate)?;
        let mut entries = Vec::new();
        for project in &current.manifest.projects {
            let Some(before) = previous.project(&project.name) else {
                continue;
            };
            if before.revision == project.revision {
                continue;
            }
            let commits = self
                .repo
                .log_since(&project.name, &before.revision, &project.revision)
                .await?;
            entries.extend(commits.into_iter().map(|c| BlameEntry {
                project: project.name.clone(),
                chump: c.review_url.is_none(),
                commit: c.sha,
                subject: c.subject,
                change_id: c.change_id,
                review_url: c.review_url,
            }));
        }
        Ok(entries)
    }
}
