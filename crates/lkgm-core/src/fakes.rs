//! In-memory fakes for the external capabilities (testing only)
//!
//! Each fake records the calls it receives so tests can assert on side
//! effects (notifications, removed ready markers, launched jobs).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::capabilities::{JobId, PatchProvider, RepositoryClient, TreeStatus, TrybotLauncher};
use crate::domain::{Change, CommitInfo, LkgmError, Manifest, Result, Version};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RepoState {
    manifest: Manifest,
    version: Option<Version>,
    checkouts: Vec<Manifest>,
    /// Per-project history, oldest first.
    history: HashMap<String, Vec<CommitInfo>>,
    syncs: u32,
}

/// A checkout whose snapshot and version file are set by the test.
#[derive(Debug, Default)]
pub struct FakeRepository {
    state: Mutex<RepoState>,
}

impl FakeRepository {
    pub fn new(manifest: Manifest, version: Version) -> Self {
        Self {
            state: Mutex::new(RepoState {
                manifest,
                version: Some(version),
                ..RepoState::default()
            }),
        }
    }

    pub fn set_manifest(&self, manifest: Manifest) {
        lock(&self.state).manifest = manifest;
    }

    pub fn set_version(&self, version: Version) {
        lock(&self.state).version = Some(version);
    }

    /// Append a commit to `project`'s history.
    pub fn push_commit(&self, project: &str, commit: CommitInfo) {
        lock(&self.state)
            .history
            .entry(project.to_string())
            .or_default()
            .push(commit);
    }

    /// Manifests passed to `checkout`, in call order.
    pub fn checkouts(&self) -> Vec<Manifest> {
        lock(&self.state).checkouts.clone()
    }

    pub fn sync_count(&self) -> u32 {
        lock(&self.state).syncs
    }
}

#[async_trait]
impl RepositoryClient for FakeRepository {
    async fn sync(&self) -> Result<()> {
        lock(&self.state).syncs += 1;
        Ok(())
    }

    async fn checkout(&self, manifest: &Manifest) -> Result<()> {
        lock(&self.state).checkouts.push(manifest.clone());
        Ok(())
    }

    async fn export_manifest(&self) -> Result<Manifest> {
        Ok(lock(&self.state).manifest.clone())
    }

    async fn read_version(&self) -> Result<Version> {
        lock(&self.state)
            .version
            .ok_or_else(|| LkgmError::Repository("no version file".into()))
    }

    async fn log_since(&self, project: &str, from: &str, to: &str) -> Result<Vec<CommitInfo>> {
        let state = lock(&self.state);
        let history = state.history.get(project).cloned().unwrap_or_default();
        let end = history
            .iter()
            .position(|c| c.sha == to)
            .ok_or_else(|| LkgmError::Repository(format!("{project}: unknown revision {to}")))?;
        let start = history
            .iter()
            .position(|c| c.sha == from)
            .map(|i| i + 1)
            .unwrap_or(0);
        if start > end {
            return Ok(Vec::new());
        }
        Ok(history[start..=end].iter().rev().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Review system
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ReviewState {
    ready: Vec<Change>,
    dependencies: HashMap<u64, Vec<u64>>,
    apply_failures: HashSet<u64>,
    applied: Vec<u64>,
    removed: Vec<u64>,
    notifications: Vec<(u64, String)>,
}

#[derive(Debug, Default)]
pub struct FakePatchProvider {
    state: Mutex<ReviewState>,
}

impl FakePatchProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ready(&self, change: Change) {
        lock(&self.state).ready.push(change);
    }

    pub fn set_dependencies(&self, change: u64, depends_on: Vec<u64>) {
        lock(&self.state).dependencies.insert(change, depends_on);
    }

    /// Make `apply` fail for `change`.
    pub fn fail_apply(&self, change: u64) {
        lock(&self.state).apply_failures.insert(change);
    }

    pub fn is_ready(&self, change: u64) -> bool {
        lock(&self.state).ready.iter().any(|c| c.number == change)
    }

    pub fn applied(&self) -> Vec<u64> {
        lock(&self.state).applied.clone()
    }

    pub fn removed(&self) -> Vec<u64> {
        lock(&self.state).removed.clone()
    }

    pub fn notifications(&self) -> Vec<(u64, String)> {
        lock(&self.state).notifications.clone()
    }

    pub fn notifications_for(&self, change: u64) -> Vec<String> {
        lock(&self.state)
            .notifications
            .iter()
            .filter(|(n, _)| *n == change)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

#[async_trait]
impl PatchProvider for FakePatchProvider {
    async fn query_ready(&self, _query: &str) -> Result<Vec<Change>> {
        Ok(lock(&self.state).ready.clone())
    }

    async fn dependencies(&self, change: &Change) -> Result<Vec<u64>> {
        Ok(lock(&self.state)
            .dependencies
            .get(&change.number)
            .cloned()
            .unwrap_or_default())
    }

    async fn apply(&self, change: &Change) -> Result<String> {
        let mut state = lock(&self.state);
        if state.apply_failures.contains(&change.number) {
            return Err(LkgmError::PatchProvider {
                change: change.number,
                detail: "patch does not apply cleanly".to_string(),
            });
        }
        state.applied.push(change.number);
        Ok(change.commit.clone())
    }

    async fn remove_ready(&self, change: &Change) -> Result<()> {
        let mut state = lock(&self.state);
        state.ready.retain(|c| c.number != change.number);
        state.removed.push(change.number);
        Ok(())
    }

    async fn notify(&self, change: &Change, message: &str) -> Result<()> {
        lock(&self.state)
            .notifications
            .push((change.number, message.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tree status and launcher
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FakeTreeStatus {
    open: AtomicBool,
}

impl FakeTreeStatus {
    pub fn open() -> Self {
        Self {
            open: AtomicBool::new(true),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

impl Default for FakeTreeStatus {
    fn default() -> Self {
        Self::open()
    }
}

#[async_trait]
impl TreeStatus for FakeTreeStatus {
    async fn is_open(&self) -> Result<bool> {
        Ok(self.open.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Default)]
pub struct FakeLauncher {
    launches: Mutex<Vec<(JobId, Vec<u64>)>>,
    failing: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Change numbers of every launched job, in launch order.
    pub fn launched(&self) -> Vec<Vec<u64>> {
        lock(&self.launches)
            .iter()
            .map(|(_, changes)| changes.clone())
            .collect()
    }

    pub fn launch_count(&self) -> usize {
        lock(&self.launches).len()
    }
}

#[async_trait]
impl TrybotLauncher for FakeLauncher {
    async fn launch(&self, changes: &[Change]) -> Result<JobId> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LkgmError::Launch("scheduler unavailable".to_string()));
        }
        let id = JobId::new();
        lock(&self.launches).push((id, changes.iter().map(|c| c.number).collect()));
        Ok(id)
    }
}
