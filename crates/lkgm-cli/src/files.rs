//! Repository client backed by files on disk.
//!
//! The CLI does not drive a real multi-repository checkout. It reads the
//! snapshot from a manifest file the caller already exported, the version
//! from a shell-style version file, and "checks out" a candidate by writing
//! its manifest to an output path.

use std::path::PathBuf;

use async_trait::async_trait;
use lkgm_core::{CommitInfo, LkgmError, Manifest, RepositoryClient, Result, Version};
use tracing::info;

#[derive(Debug, Default)]
pub struct ManifestFiles {
    manifest: Option<PathBuf>,
    version: Option<PathBuf>,
    output: Option<PathBuf>,
}

impl ManifestFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manifest(mut self, path: PathBuf) -> Self {
        self.manifest = Some(path);
        self
    }

    pub fn with_version_file(mut self, path: PathBuf) -> Self {
        self.version = Some(path);
        self
    }

    pub fn with_output(mut self, path: PathBuf) -> Self {
        self.output = Some(path);
        self
    }

    async fn read(path: &Option<PathBuf>, what: &str) -> Result<String> {
        let path = path
            .as_ref()
            .ok_or_else(|| LkgmError::Repository(format!("no {what} file given")))?;
        tokio::fs::read_to_string(path).await.map_err(|e| {
            LkgmError::Repository(format!("cannot read {what} file {}: {e}", path.display()))
        })
    }
}

#[async_trait]
impl RepositoryClient for ManifestFiles {
    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn checkout(&self, manifest: &Manifest) -> Result<()> {
        match &self.output {
            Some(path) => {
                tokio::fs::write(path, manifest.render()).await?;
                info!(path = %path.display(), "candidate manifest written");
            }
            None => print!("{}", manifest.render()),
        }
        Ok(())
    }

    async fn export_manifest(&self) -> Result<Manifest> {
        Manifest::parse(&Self::read(&self.manifest, "manifest").await?)
    }

    async fn read_version(&self) -> Result<Version> {
        Version::from_version_file(&Self::read(&self.version, "version").await?)
    }

    async fn log_since(&self, project: &str, _from: &str, _to: &str) -> Result<Vec<CommitInfo>> {
        Err(LkgmError::Repository(format!(
            "{project}: commit history is not available from manifest files"
        )))
    }
}
