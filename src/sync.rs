//! Backup engine - orchestrates one mirroring cycle
//!
//! Local half: scan source against the mirror, let the sync tool confirm the
//! candidates, push them into the mirror. Remote half: compare the mirror with
//! the remote, push, and reconcile the mirror against the remote listing.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::changes::{ChangeKind, Changes};
use crate::config::Config;
use crate::context::CycleContext;
use crate::error::SyncError;
use crate::executor::Executor;
use crate::listing::{CommandListing, FileListing, ListingSource};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::scanner::{ScanReport, Scanner, SkippedPath};

/// Results from a status or push operation
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    /// Candidate paths examined by the local scan (zero for remote operations)
    pub scanned: u64,
    pub skipped: Vec<SkippedPath>,
    pub changes: Changes,
    /// Whether the changes were pushed or only reported
    pub pushed: bool,
    pub duration: Duration,
}

impl SyncSummary {
    pub fn created(&self) -> usize {
        self.changes.count(ChangeKind::Created)
    }

    pub fn modified(&self) -> usize {
        self.changes.count(ChangeKind::Modified)
    }

    pub fn deleted(&self) -> usize {
        self.changes.count(ChangeKind::Deleted)
    }
}

/// Runs cycles for one loaded configuration
pub struct BackupEngine {
    ctx: CycleContext,
}

impl BackupEngine {
    pub fn new(config: Config) -> Result<Self> {
        let ctx = CycleContext::load(config).context("Failed to prepare cycle")?;
        Ok(Self { ctx })
    }

    pub fn context(&self) -> &CycleContext {
        &self.ctx
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn scan(&self) -> Result<ScanReport> {
        Scanner::new(&self.ctx).scan()
    }

    /// Changes between source and mirror
    pub async fn status_local(&self) -> Result<SyncSummary> {
        self.local(false).await
    }

    /// Bring the mirror up to date with the source
    pub async fn push_local(&self) -> Result<SyncSummary> {
        self.local(true).await
    }

    /// Changes between mirror and remote
    pub async fn status_remote(&self) -> Result<SyncSummary> {
        self.remote(false).await
    }

    /// Bring the remote up to date with the mirror
    pub async fn push_remote(&self) -> Result<SyncSummary> {
        self.remote(true).await
    }

    /// Align the mirror with the remote listing without transferring content
    pub async fn reconcile_remote(&self, listing: &dyn ListingSource) -> Result<ReconcileReport> {
        Reconciler::new(&self.ctx).reconcile(listing).await
    }

    /// The report file if given, otherwise the configured listing command
    pub fn listing_source(&self, file: Option<&Path>) -> Box<dyn ListingSource> {
        match file {
            Some(path) => Box::new(FileListing::new(path)),
            None => Box::new(CommandListing::new(self.ctx.config.listing.command.clone())),
        }
    }

    async fn local(&self, push: bool) -> Result<SyncSummary> {
        let start = Instant::now();
        let source = self.ctx.source_root();
        let cache = self.ctx.cache_root();

        let scan = self.scan()?;
        let candidates = scan.changed_paths();
        debug!("{} candidate paths from scan", candidates.len());

        let executor = Executor::new(&self.ctx);
        let changes = executor.status(&source, &cache, Some(&candidates)).await?;
        if push {
            executor.push(&source, &cache, &changes.paths()).await?;
        }

        let summary = SyncSummary {
            scanned: scan.visited,
            skipped: scan.skipped,
            changes,
            pushed: push,
            duration: start.elapsed(),
        };
        log_summary("Local", &summary);
        Ok(summary)
    }

    async fn remote(&self, push: bool) -> Result<SyncSummary> {
        let start = Instant::now();
        let cache = self.ctx.cache_root();
        let dest = self.remote_dest()?;

        let executor = Executor::new(&self.ctx);
        let changes = executor.status(&cache, &dest, None).await?;
        if push {
            executor.push(&cache, &dest, &changes.paths()).await?;
        }

        let summary = SyncSummary {
            changes,
            pushed: push,
            duration: start.elapsed(),
            ..SyncSummary::default()
        };
        log_summary("Remote", &summary);
        Ok(summary)
    }

    fn remote_dest(&self) -> Result<PathBuf> {
        if self.ctx.config.dest.trim().is_empty() {
            return Err(SyncError::Config("no remote destination configured".to_string()).into());
        }
        Ok(self.ctx.config.dest_path())
    }
}

fn log_summary(side: &str, summary: &SyncSummary) {
    info!(
        "{} {} completed in {:.2}s: {} created, {} modified, {} deleted",
        side,
        if summary.pushed { "push" } else { "status" },
        summary.duration.as_secs_f64(),
        summary.created(),
        summary.modified(),
        summary.deleted()
    );
}
