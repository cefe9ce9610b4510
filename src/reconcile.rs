//! Remote reconciler - align the mirror with the remote without moving content
//!
//! A mirror file whose date disagrees with the remote is replaced by a one-byte
//! sentinel whose mtime is nudged forward, so the next local status flags it
//! and the real content gets pushed again. Files the remote no longer has are
//! removed from the mirror once the whole listing has been walked.

use anyhow::{Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::context::CycleContext;
use crate::listing::{ListingEntry, ListingParser, ListingSource, RemoteDate};
use crate::tags::MTIME_TAG;

/// What a reconciliation pass changed in the mirror
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Mirror files overwritten with a sentinel
    pub touched: Vec<PathBuf>,
    /// Mirror files removed because the remote lacks them
    pub deleted: Vec<PathBuf>,
    /// Remote entries seen
    pub present: usize,
    /// Entries left alone because the recorded original mtime matched
    pub tag_matches: usize,
    pub duration: Duration,
}

pub struct Reconciler<'a> {
    ctx: &'a CycleContext,
    utc: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(ctx: &'a CycleContext) -> Self {
        Self {
            ctx,
            utc: ctx.config.listing.utc,
        }
    }

    /// Fetch and parse the full listing, then apply it; a failed fetch edits nothing
    pub async fn reconcile(&self, source: &dyn ListingSource) -> Result<ReconcileReport> {
        let text = source
            .fetch()
            .await
            .with_context(|| format!("Failed to fetch listing from {}", source.source_name()))?;
        let entries = ListingParser::from_config(&self.ctx.config.listing)?.parse(&text)?;
        self.apply(&entries)
    }

    /// Apply a parsed listing; an entry escaping the mirror rejects the listing before any edit
    pub fn apply(&self, entries: &[ListingEntry]) -> Result<ReconcileReport> {
        let start = Instant::now();
        for entry in entries {
            entry.validate()?;
        }

        let cache_root = self.ctx.cache_root();
        let source_root = self.ctx.source_root();

        let mut report = ReconcileReport::default();
        let mut present: HashSet<PathBuf> = HashSet::with_capacity(entries.len());

        for entry in entries {
            let mirror = cache_root.join(&entry.path);
            if mirror.is_dir() {
                debug!("Skipping directory entry {}", entry.path.display());
                continue;
            }
            match self.mirror_date(&mirror)? {
                Some(date) if date == entry.date => {}
                _ if self.tag_matches(&mirror, entry.date)? => {
                    debug!("Recorded mtime of {} matches the remote", entry.path.display());
                    report.tag_matches += 1;
                }
                _ => {
                    write_sentinel(&source_root.join(&entry.path), &mirror)?;
                    debug!("Touched {}", entry.path.display());
                    report.touched.push(entry.path.clone());
                }
            }
            present.insert(entry.path.clone());
        }
        report.present = present.len();

        report.deleted = self.delete_absent(&cache_root, &source_root, &present)?;
        report.duration = start.elapsed();

        info!(
            "Reconciled in {:.2}s: {} remote entries, {} touched, {} deleted, {} kept by tag",
            report.duration.as_secs_f64(),
            report.present,
            report.touched.len(),
            report.deleted.len(),
            report.tag_matches
        );

        Ok(report)
    }

    fn mirror_date(&self, mirror: &Path) -> Result<Option<RemoteDate>> {
        match fs::metadata(mirror).and_then(|metadata| metadata.modified()) {
            Ok(modified) => Ok(Some(RemoteDate::from_system_time(modified, self.utc))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", mirror.display())),
        }
    }

    fn tag_matches(&self, mirror: &Path, remote: RemoteDate) -> Result<bool> {
        if !mirror.is_file() {
            return Ok(false);
        }
        Ok(self
            .ctx
            .tags
            .mtime(mirror)?
            .is_some_and(|tagged| RemoteDate::from_system_time(tagged, self.utc) == remote))
    }

    fn delete_absent(&self, cache_root: &Path, source_root: &Path, present: &HashSet<PathBuf>) -> Result<Vec<PathBuf>> {
        let mut deleted = Vec::new();
        if !cache_root.is_dir() {
            return Ok(deleted);
        }

        let walker = WalkDir::new(cache_root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|item| item.depth() == 0 || item.path() != source_root);

        for item in walker {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    warn!("Skipping unreadable mirror path: {}", e);
                    continue;
                }
            };
            if !item.file_type().is_file() {
                continue;
            }
            let Ok(relative) = item.path().strip_prefix(cache_root) else {
                continue;
            };
            if present.contains(relative) || !self.ctx.rules.is_included(relative) {
                continue;
            }

            fs::remove_file(item.path()).with_context(|| format!("Failed to delete {}", item.path().display()))?;
            self.ctx.tags.clear(item.path(), MTIME_TAG)?;
            debug!("Deleted {}", relative.display());
            deleted.push(relative.to_path_buf());
        }

        Ok(deleted)
    }
}

/// Replace the mirror content with an empty or single-space placeholder one second newer
fn write_sentinel(source: &Path, mirror: &Path) -> Result<()> {
    let source_len = match fs::metadata(source) {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => 0,
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", source.display())),
    };
    let content: &[u8] = if source_len == 0 { b"" } else { b" " };

    let previous = match fs::metadata(mirror) {
        Ok(metadata) => Some(FileTime::from_last_modification_time(&metadata)),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", mirror.display())),
    };

    if let Some(parent) = mirror.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(mirror, content).with_context(|| format!("Failed to write {}", mirror.display()))?;

    if let Some(previous) = previous {
        let nudged = FileTime::from_unix_time(previous.unix_seconds() + 1, previous.nanoseconds());
        set_file_mtime(mirror, nudged).with_context(|| format!("Failed to set mtime on {}", mirror.display()))?;
    }
    Ok(())
}
