//! Candidate files in the shared ledger.
//!
//! Layout:
//!
//! ```text
//! <line>/<version>.xml       one immutable file per published candidate
//! LKGM/lkgm.xml              baseline pointer: "<line>/<version>.xml"
//! ```
//!
//! Reads are pinned to the agent's checkout revision, which only moves on
//! [`ManifestStore::refresh_checkout`] or after this agent's own pushes.
//! Writes go through the push-retry loop and re-read everything they depend
//! on from the fresh tip.

use std::collections::HashMap;
use std::sync::Arc;

use manifest_ledger::{LedgerCommit, LedgerRevision, LedgerStore};
use tracing::{info, instrument, warn};

use crate::domain::{BuildLine, LkgmError, Manifest, Result, Version};
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::{commit_with_retry, Attempt};

pub const DEFAULT_BASELINE_PATH: &str = "LKGM/lkgm.xml";

pub struct ManifestStore {
    ledger: Arc<dyn LedgerStore>,
    retries: u32,
    baseline_path: String,
    checkout: Option<LedgerRevision>,
    last_processed: HashMap<BuildLine, Version>,
}

impl ManifestStore {
    pub fn new(ledger: Arc<dyn LedgerStore>, retries: u32) -> Self {
        Self {
            ledger,
            retries: retries.max(1),
            baseline_path: DEFAULT_BASELINE_PATH.to_string(),
            checkout: None,
            last_processed: HashMap::new(),
        }
    }

    pub fn with_baseline_path(mut self, path: impl Into<String>) -> Self {
        self.baseline_path = path.into();
        self
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn baseline_path(&self) -> &str {
        &self.baseline_path
    }

    /// Revision reads are currently pinned to, if any.
    pub fn checkout(&self) -> Option<&LedgerRevision> {
        self.checkout.as_ref()
    }

    /// Move the checkout to the ledger tip.
    #[instrument(skip(self))]
    pub async fn refresh_checkout(&mut self) -> Result<LedgerRevision> {
        let tip = self
            .ledger
            .fetch_tip()
            .await
            .map_err(|e| LkgmError::Refresh {
                detail: e.to_string(),
            })?;
        self.checkout = Some(tip.clone());
        Ok(tip)
    }

    /// [`Self::refresh_checkout`], retried up to the push-retry budget while
    /// the failure is transient.
    #[instrument(skip(self))]
    pub async fn refresh_checkout_with_retry(&mut self) -> Result<LedgerRevision> {
        let mut attempt = 1;
        loop {
            match self.refresh_checkout().await {
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    warn!(attempt, retries = self.retries, error = %e, "ledger refresh failed, retrying");
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn pinned(&mut self) -> Result<LedgerRevision> {
        match &self.checkout {
            Some(rev) => Ok(rev.clone()),
            None => self.refresh_checkout().await,
        }
    }

    /// All published versions on `line` at the checkout, ascending.
    pub async fn versions(&mut self, line: BuildLine) -> Result<Vec<Version>> {
        let at = self.pinned().await?;
        versions_at(self.ledger.as_ref(), &at, line).await
    }

    /// Highest published version on `line`.
    pub async fn latest(&mut self, line: BuildLine) -> Result<Option<Version>> {
        Ok(self.versions(line).await?.pop())
    }

    /// The candidate this agent should pick up next.
    ///
    /// Before anything has been processed that is the newest candidate, so a
    /// fresh agent does not walk the whole history. Afterwards it is the
    /// smallest candidate newer than the last processed one.
    pub async fn latest_unprocessed(&mut self, line: BuildLine) -> Result<Option<Version>> {
        let versions = self.versions(line).await?;
        Ok(match self.last_processed.get(&line) {
            None => versions.last().copied(),
            Some(done) => versions.into_iter().find(|v| v > done),
        })
    }

    pub fn last_processed(&self, line: BuildLine) -> Option<Version> {
        self.last_processed.get(&line).copied()
    }

    /// Record that `version` has been claimed. Never moves backwards.
    pub fn mark_processed(&mut self, line: BuildLine, version: Version) {
        let entry = self.last_processed.entry(line).or_insert(version);
        if version > *entry {
            *entry = version;
        }
    }

    /// Read and parse a published candidate at the checkout.
    pub async fn read_candidate(
        &mut self,
        line: BuildLine,
        version: &Version,
    ) -> Result<Option<Manifest>> {
        let at = self.pinned().await?;
        let Some(bytes) = self.ledger.read(&at, &line.candidate_path(version)).await? else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes)
            .map_err(|e| LkgmError::Manifest(format!("{line}/{version}: {e}")))?;
        Manifest::parse(&text).map(Some)
    }

    /// Publish `manifest` as the next candidate on `line`.
    ///
    /// The version is `max(local, latest).increment_revision()`, resolved
    /// against the tip on every attempt, so a lost race publishes the next
    /// free revision instead of overwriting the winner.
    #[instrument(skip(self, manifest), fields(line = %line, local = %local))]
    pub async fn publish(
        &mut self,
        line: BuildLine,
        manifest: &Manifest,
        local: &Version,
    ) -> Result<Version> {
        let ledger = self.ledger.clone();
        let body = manifest.render();
        let local = *local;
        let mut attempt = 0u32;

        let outcome = commit_with_retry(&self.ledger, self.retries, line.dir(), |tip| {
            attempt += 1;
            let ledger = ledger.clone();
            let body = body.clone();
            async move {
                let latest = versions_at(ledger.as_ref(), &tip, line).await?.pop();
                let next = latest.map_or(local, |l| l.max(local)).increment_revision()?;
                let path = line.candidate_path(&next);
                if ledger.read(&tip, &path).await?.is_some() {
                    return Err(LkgmError::GenerateBuildSpec {
                        line: line.to_string(),
                        attempts: attempt,
                        detail: format!("{path} already exists"),
                    });
                }
                Ok(Attempt::Commit {
                    commit: LedgerCommit::new(format!("Automatic: Start {line} {next}"))
                        .with_write(path, body),
                    value: (next, attempt),
                })
            }
        })
        .await;

        let ((version, attempts), revision) = outcome.map_err(|f| {
            f.into_error(|attempts, detail| LkgmError::GenerateBuildSpec {
                line: line.to_string(),
                attempts,
                detail,
            })
        })?;
        self.checkout = Some(revision);
        METRICS.inc_candidates_published();
        obs::emit_candidate_published(line, &version, attempts);
        Ok(version)
    }

    /// Publish `manifest` under a version chosen elsewhere.
    ///
    /// Used to mirror a master's candidate into a secondary ledger. An
    /// identical file already present is success; a different one is an
    /// error since published candidates never change.
    #[instrument(skip(self, manifest), fields(line = %line, version = %version))]
    pub async fn publish_exact(
        &mut self,
        line: BuildLine,
        version: &Version,
        manifest: &Manifest,
    ) -> Result<()> {
        let ledger = self.ledger.clone();
        let body = manifest.render();
        let path = line.candidate_path(version);
        let version = *version;

        let outcome = commit_with_retry(&self.ledger, self.retries, &path, |tip| {
            let ledger = ledger.clone();
            let body = body.clone();
            let path = path.clone();
            async move {
                match ledger.read(&tip, &path).await? {
                    Some(existing) if existing == body.as_bytes() => Ok(Attempt::Done(false)),
                    Some(_) => Err(LkgmError::GenerateBuildSpec {
                        line: line.to_string(),
                        attempts: 1,
                        detail: format!("{path} already published with different contents"),
                    }),
                    None => Ok(Attempt::Commit {
                        commit: LedgerCommit::new(format!("Automatic: Start {line} {version}"))
                            .with_write(path, body),
                        value: true,
                    }),
                }
            }
        })
        .await;

        let (written, revision) = outcome.map_err(|f| {
            f.into_error(|attempts, detail| LkgmError::GenerateBuildSpec {
                line: line.to_string(),
                attempts,
                detail,
            })
        })?;
        self.checkout = Some(revision);
        if written {
            METRICS.inc_candidates_published();
            obs::emit_candidate_published(line, &version, 1);
        } else {
            info!("candidate already mirrored");
        }
        Ok(())
    }

    /// Point the baseline at `version` on `line`.
    #[instrument(skip(self), fields(line = %line, version = %version))]
    pub async fn promote(&mut self, line: BuildLine, version: &Version) -> Result<()> {
        let ledger = self.ledger.clone();
        let target = line.candidate_path(version);
        let pointer = self.baseline_path.clone();
        let version = *version;

        let outcome = commit_with_retry(&self.ledger, self.retries, &pointer, |tip| {
            let ledger = ledger.clone();
            let target = target.clone();
            let pointer = pointer.clone();
            async move {
                if ledger.read(&tip, &target).await?.is_none() {
                    return Err(LkgmError::PromoteCandidate {
                        version: version.to_string(),
                        detail: format!("{target} is not published"),
                    });
                }
                let body = format!("{target}\n");
                if ledger.read(&tip, &pointer).await?.as_deref() == Some(body.as_bytes()) {
                    return Ok(Attempt::Done(()));
                }
                Ok(Attempt::Commit {
                    commit: LedgerCommit::new(format!("Automatic: Promote {line} {version}"))
                        .with_write(pointer, body),
                    value: (),
                })
            }
        })
        .await;

        let ((), revision) = outcome.map_err(|f| {
            f.into_error(|_, detail| LkgmError::PromoteCandidate {
                version: version.to_string(),
                detail,
            })
        })?;
        self.checkout = Some(revision);
        METRICS.inc_promotions();
        obs::emit_candidate_promoted(line, &version);
        Ok(())
    }

    /// The candidate the baseline pointer references at the checkout.
    pub async fn baseline(&mut self) -> Result<Option<(BuildLine, Version)>> {
        let at = self.pinned().await?;
        let Some(bytes) = self.ledger.read(&at, &self.baseline_path).await? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        let target = text.trim();
        let (dir, file) = target.split_once('/').ok_or_else(|| LkgmError::Parse {
            input: target.to_string(),
            reason: "baseline pointer must be <line>/<version>.xml".to_string(),
        })?;
        Ok(Some((dir.parse()?, Version::from_file_name(file)?)))
    }
}

pub(crate) async fn versions_at(
    ledger: &dyn LedgerStore,
    at: &LedgerRevision,
    line: BuildLine,
) -> Result<Vec<Version>> {
    let mut versions: Vec<Version> = ledger
        .list(at, line.dir())
        .await?
        .into_iter()
        .filter_map(|name| match Version::from_file_name(&name) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(line = %line, file = %name, error = %e, "skipping unparseable candidate file");
                None
            }
        })
        .collect();
    versions.sort();
    Ok(versions)
}
