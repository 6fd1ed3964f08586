//! LKGM - manifest ledger command-line tool
//!
//! The `lkgm` command runs the ledger-side operations of a build agent
//! against a git-backed manifest ledger.
//!
//! ## Commands
//!
//! - `latest`: Show the newest candidate and the promoted baseline
//! - `show`: Print a candidate manifest
//! - `publish`: Publish the next candidate from an exported manifest
//! - `wait`: Wait for an unprocessed candidate and write it out
//! - `promote`: Point the baseline at a candidate
//! - `report-status` / `builder-status`: Exchange builder results
//! - `filter`: Strip a manifest down to allow-listed remotes

mod files;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lkgm_core::{
    BuildLine, BuildStatus, BuilderStatusPoller, CandidateManager, LkgmConfig, Manifest,
    ManifestStore, PollConfig, StatusSummary, SystemClock, Version,
};
use manifest_ledger::{GitLedger, LedgerStore};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

use files::ManifestFiles;

#[derive(Parser)]
#[command(name = "lkgm")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build-candidate coordination over a manifest ledger", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "LKGM_CONFIG")]
    config: Option<PathBuf>,

    /// Build line to operate on
    #[arg(long, global = true, default_value = "commit-queue")]
    line: BuildLine,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the newest candidate and the promoted baseline
    Latest,

    /// Print a candidate manifest
    Show {
        /// Candidate version, e.g. 41.0.0-rc3
        version: Version,
    },

    /// Publish the next candidate from an exported manifest
    Publish {
        /// Snapshot manifest of the source tree
        #[arg(short, long)]
        manifest: PathBuf,

        /// Shell-style version file (MAJOR=, MINOR=, PATCH=)
        #[arg(long)]
        version_file: PathBuf,

        /// Publish even if nothing changed since the latest candidate
        #[arg(long)]
        force: bool,
    },

    /// Wait for a candidate this agent has not processed and write it out
    ///
    /// A timeout with no new candidate is not an error; nothing is written.
    Wait {
        /// Treat this version and everything before it as processed
        #[arg(long)]
        after: Option<Version>,

        /// Where to write the manifest (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Override the configured long timeout
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Promote a candidate to the baseline
    Promote {
        /// Candidate version to promote
        version: Version,
    },

    /// Record this builder's status for a candidate
    ReportStatus {
        #[arg(long)]
        builder: String,

        #[arg(long)]
        version: Version,

        #[arg(long, value_enum)]
        status: StatusArg,

        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show builder statuses for a candidate
    BuilderStatus {
        #[arg(long)]
        version: Version,

        /// Builder to query (repeatable)
        #[arg(long = "builder", required = true)]
        builders: Vec<String>,

        /// Poll until every builder finishes or the long timeout elapses
        #[arg(long)]
        wait: bool,

        /// Print the status map as JSON
        #[arg(long)]
        as_json: bool,
    },

    /// Filter a manifest down to allow-listed remotes
    Filter {
        /// Manifest to filter
        manifest: PathBuf,

        /// Allowed remotes (default: from configuration)
        #[arg(long, value_delimiter = ',')]
        remotes: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Inflight,
    Passed,
    Failed,
}

impl From<StatusArg> for BuildStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Inflight => BuildStatus::Inflight,
            StatusArg::Passed => BuildStatus::Passed,
            StatusArg::Failed => BuildStatus::Failed,
        }
    }
}

/// Everything a command needs: the ledger, configuration and build line.
struct Session {
    ledger: Arc<dyn LedgerStore>,
    config: LkgmConfig,
    line: BuildLine,
}

impl Session {
    fn store(&self) -> ManifestStore {
        ManifestStore::new(self.ledger.clone(), self.config.retries)
            .with_baseline_path(self.config.ledger.baseline_path.clone())
    }

    fn manager(&self, repo: ManifestFiles, poll: PollConfig) -> CandidateManager {
        CandidateManager::new(self.store(), Arc::new(repo), self.line, poll)
            .with_allowed_remotes(self.config.allowed_remote_set())
    }

    fn poller(&self) -> BuilderStatusPoller {
        BuilderStatusPoller::new(
            self.ledger.clone(),
            self.line,
            self.config.retries,
            self.config.poll.long(),
            Arc::new(SystemClock),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    lkgm_core::telemetry::init_tracing(cli.json, level);

    let config = LkgmConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let ledger = GitLedger::new(
        config.ledger.workdir.clone(),
        config.ledger.remote.clone(),
        config.ledger.branch.clone(),
    )
    .with_identity(
        config.ledger.author_name.clone(),
        config.ledger.author_email.clone(),
    );
    let ctx = Session {
        ledger: Arc::new(ledger),
        config,
        line: cli.line,
    };

    let result = match cli.command {
        Commands::Latest => cmd_latest(&ctx).await,
        Commands::Show { version } => cmd_show(&ctx, &version).await,
        Commands::Publish {
            manifest,
            version_file,
            force,
        } => cmd_publish(&ctx, manifest, version_file, force).await,
        Commands::Wait {
            after,
            output,
            timeout_secs,
        } => cmd_wait(&ctx, after, output, timeout_secs).await,
        Commands::Promote { version } => cmd_promote(&ctx, &version).await,
        Commands::ReportStatus {
            builder,
            version,
            status,
            message,
        } => cmd_report_status(&ctx, &builder, &version, status.into(), message).await,
        Commands::BuilderStatus {
            version,
            builders,
            wait,
            as_json,
        } => cmd_builder_status(&ctx, &version, &builders, wait, as_json).await,
        Commands::Filter { manifest, remotes } => cmd_filter(&ctx, &manifest, &remotes).await,
    };
    lkgm_core::metrics::METRICS.flush();
    result
}

async fn cmd_latest(ctx: &Session) -> Result<()> {
    let mut store = ctx.store();
    store
        .refresh_checkout()
        .await
        .context("Failed to refresh ledger")?;
    match store.latest(ctx.line).await? {
        Some(version) => println!("{}: {}", ctx.line, version),
        None => println!("{}: no candidates", ctx.line),
    }
    match store.baseline().await? {
        Some((line, version)) => println!("baseline: {line} {version}"),
        None => println!("baseline: none"),
    }
    Ok(())
}

async fn cmd_show(ctx: &Session, version: &Version) -> Result<()> {
    let mut store = ctx.store();
    store.refresh_checkout().await?;
    let Some(manifest) = store.read_candidate(ctx.line, version).await? else {
        bail!("{} {} is not published", ctx.line, version);
    };
    print!("{}", manifest.render());
    Ok(())
}

async fn cmd_publish(
    ctx: &Session,
    manifest: PathBuf,
    version_file: PathBuf,
    force: bool,
) -> Result<()> {
    let repo = ManifestFiles::new()
        .with_manifest(manifest)
        .with_version_file(version_file);
    let mut manager = ctx.manager(repo, ctx.config.poll.short());
    match manager
        .create_candidate(&[], force)
        .await
        .context("Failed to publish candidate")?
    {
        Some(candidate) => {
            println!("Published {} {}", candidate.line, candidate.version);
            println!("Path: {}", candidate.line.candidate_path(&candidate.version));
        }
        None => println!("No changes since the latest {} candidate", ctx.line),
    }
    Ok(())
}

async fn cmd_wait(
    ctx: &Session,
    after: Option<Version>,
    output: Option<PathBuf>,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let mut poll = ctx.config.poll.long();
    if let Some(secs) = timeout_secs {
        poll = PollConfig::new(poll.interval, Duration::from_secs(secs));
    }
    let mut repo = ManifestFiles::new();
    if let Some(path) = output {
        repo = repo.with_output(path);
    }
    let mut manager = ctx.manager(repo, poll);
    if let Some(after) = after {
        manager.store_mut().mark_processed(ctx.line, after);
    }
    match manager.get_latest_candidate().await? {
        Some(candidate) => {
            info!(version = %candidate.version, "picked up candidate");
            eprintln!("{} {}", candidate.line, candidate.version);
            Ok(())
        }
        None => {
            println!(
                "No new {} candidate within {}s",
                ctx.line,
                poll.timeout.as_secs()
            );
            Ok(())
        }
    }
}

async fn cmd_promote(ctx: &Session, version: &Version) -> Result<()> {
    let mut store = ctx.store();
    store
        .promote(ctx.line, version)
        .await
        .context("Failed to promote candidate")?;
    println!("Promoted {} {} to {}", ctx.line, version, store.baseline_path());
    Ok(())
}

async fn cmd_report_status(
    ctx: &Session,
    builder: &str,
    version: &Version,
    status: BuildStatus,
    message: Option<String>,
) -> Result<()> {
    ctx.poller()
        .report_status(builder, version, status, message)
        .await
        .context("Failed to report builder status")?;
    println!("{builder}: {status} for {version}");
    Ok(())
}

async fn cmd_builder_status(
    ctx: &Session,
    version: &Version,
    builders: &[String],
    wait: bool,
    as_json: bool,
) -> Result<()> {
    let statuses = ctx
        .poller()
        .get_builders_status(version, builders, wait)
        .await;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }
    for (name, status) in &statuses {
        println!("{name:<32} {status}");
    }
    let summary = StatusSummary::from_map(&statuses);
    println!(
        "\n{} passed, {} failed, {} inflight, {} missing",
        summary.passed.len(),
        summary.failed.len(),
        summary.inflight.len(),
        summary.missing.len()
    );
    Ok(())
}

async fn cmd_filter(ctx: &Session, path: &Path, remotes: &[String]) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let manifest = Manifest::parse(&text)?;
    let allowed: BTreeSet<String> = if remotes.is_empty() {
        ctx.config.allowed_remote_set()
    } else {
        remotes.iter().cloned().collect()
    };
    print!("{}", manifest.filtered(&allowed)?.render());
    Ok(())
}
