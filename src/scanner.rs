//! Scanner - walks source and mirror and collects truly changed paths
//!
//! Both trees are walked under the compiled rules; every included regular file
//! becomes an `Entry` exactly once, whichever side it was found on, and the
//! entry classifier decides whether it changed.

use anyhow::Result;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::context::CycleContext;
use crate::entry::{Entry, Side};

const PROGRESS_EVERY: u64 = 5_000;

/// A path the scan could not classify
#[derive(Debug, Clone)]
pub struct SkippedPath {
    pub path: PathBuf,
    pub reason: String,
}

/// Results from a scan of one source/mirror pair
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Relative paths that need a transfer
    pub changed: BTreeSet<PathBuf>,
    /// Distinct candidate paths examined
    pub visited: u64,
    /// Paths skipped because they could not be read
    pub skipped: Vec<SkippedPath>,
    pub duration: Duration,
}

impl ScanReport {
    pub fn changed_paths(&self) -> Vec<PathBuf> {
        self.changed.iter().cloned().collect()
    }
}

pub struct Scanner<'a> {
    ctx: &'a CycleContext,
}

impl<'a> Scanner<'a> {
    pub fn new(ctx: &'a CycleContext) -> Self {
        Self { ctx }
    }

    /// Walk both trees; unreadable paths are reported and skipped, not fatal
    pub fn scan(&self) -> Result<ScanReport> {
        let start = Instant::now();
        let source_root = self.ctx.source_root();
        let cache_root = self.ctx.cache_root();

        info!("Scanning {} against {}", source_root.display(), cache_root.display());

        let mut report = ScanReport::default();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for (side, root, other) in [
            (Side::Source, &source_root, &cache_root),
            (Side::Dest, &cache_root, &source_root),
        ] {
            if !root.is_dir() {
                debug!("{} does not exist yet, nothing to walk", root.display());
                continue;
            }

            let walker = WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|item| self.should_walk(root, other, item));

            for item in walker {
                let item = match item {
                    Ok(item) => item,
                    Err(e) => {
                        let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                        warn!("Skipping {}: {}", path.display(), e);
                        report.skipped.push(SkippedPath {
                            path,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };
                if item.file_type().is_dir() {
                    continue;
                }

                let Ok(relative) = item.path().strip_prefix(root) else {
                    continue;
                };
                if !self.ctx.rules.is_included(relative) || !seen.insert(relative.to_path_buf()) {
                    continue;
                }

                report.visited += 1;
                self.report_progress(report.visited);

                let entry = Entry::discovered(side, &source_root, &cache_root, item.path().to_path_buf())?;
                match entry.is_changed(self.ctx) {
                    Ok(true) => {
                        debug!("Changed: {}", entry.relative.display());
                        report.changed.insert(entry.relative);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Skipping {}: {:#}", entry.relative.display(), e);
                        report.skipped.push(SkippedPath {
                            path: entry.relative,
                            reason: format!("{:#}", e),
                        });
                    }
                }
            }
        }

        report.duration = start.elapsed();

        if let Err(e) = self.ctx.state.record_path_count(&source_root, report.visited) {
            warn!("Failed to record path count: {:#}", e);
        }

        info!(
            "Scan completed in {:.2}s: {} paths, {} changed, {} skipped",
            report.duration.as_secs_f64(),
            report.visited,
            report.changed.len(),
            report.skipped.len()
        );

        Ok(report)
    }

    fn should_walk(&self, root: &Path, other_root: &Path, item: &DirEntry) -> bool {
        if item.depth() == 0 {
            return true;
        }
        // The mirror may live inside the source tree, or the other way around
        if item.path() == other_root {
            return false;
        }
        if !item.file_type().is_dir() {
            return true;
        }
        match item.path().strip_prefix(root) {
            Ok(relative) => self.ctx.rules.should_descend(relative),
            Err(_) => false,
        }
    }

    fn report_progress(&self, visited: u64) {
        if visited % PROGRESS_EVERY != 0 {
            return;
        }
        match self.ctx.expected_paths {
            Some(expected) if expected > 0 => {
                let percent = (visited as f64 / expected as f64 * 100.0).min(100.0);
                info!("Scanned {} of ~{} paths ({:.0}%)", visited, expected, percent);
            }
            _ => info!("Scanned {} paths", visited),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TagBackendKind};
    use crate::rules::RuleNode;
    use filetime::{set_file_mtime, FileTime};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn context(temp: &TempDir, adjust: impl FnOnce(&mut Config)) -> CycleContext {
        let mut config = Config::default();
        config.source = temp.path().join("source").to_string_lossy().into_owned();
        config.cache = temp.path().join("cache").to_string_lossy().into_owned();
        config.state_directory = temp.path().join("state").to_string_lossy().into_owned();
        config.tags.backend = TagBackendKind::Sidecar;
        config.excludes = Vec::new();
        std::fs::create_dir_all(temp.path().join("source")).unwrap();
        adjust(&mut config);
        CycleContext::load(config).unwrap()
    }

    fn write(root: &Path, relative: &str, content: &str, secs: i64) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[test]
    fn test_scan_classifies_seed_tree() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, |_| {});
        let (source, cache) = (ctx.source_root(), ctx.cache_root());

        write(&source, "0.txt", "A", 2_000);
        write(&cache, "0.txt", "B", 1_999);
        write(&cache, "1.txt", "x", 2_000);
        write(&source, "2.txt", "y", 2_000);
        write(&source, "3.txt", "same", 2_000);
        write(&cache, "3.txt", "same", 2_000);

        let report = Scanner::new(&ctx).scan().unwrap();
        let changed: Vec<String> = report
            .changed
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        assert_eq!(changed, vec!["0.txt", "1.txt", "2.txt"]);
        assert_eq!(report.visited, 4);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn test_scan_honours_rules() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, |config| {
            config.includes = vec![RuleNode::Branch(BTreeMap::from([(
                "docs".to_string(),
                vec![RuleNode::Leaf("keep".to_string())],
            )]))];
            config.excludes = vec![RuleNode::Leaf("docs/keep/tmp".to_string())];
        });
        let source = ctx.source_root();

        write(&source, "docs/keep/a.txt", "a", 100);
        write(&source, "docs/keep/tmp/b.txt", "b", 100);
        write(&source, "docs/other/c.txt", "c", 100);
        write(&source, "music/d.mp3", "d", 100);

        let report = Scanner::new(&ctx).scan().unwrap();
        assert_eq!(report.changed_paths(), vec![PathBuf::from("docs/keep/a.txt")]);
    }

    #[test]
    fn test_scan_skips_mirror_nested_in_source() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, |config| {
            config.cache = temp.path().join("source/.mirror").to_string_lossy().into_owned();
        });
        write(&ctx.source_root(), "a.txt", "a", 100);
        write(&ctx.cache_root(), "a.txt", "a", 100);

        let report = Scanner::new(&ctx).scan().unwrap();
        assert!(report.changed.is_empty());
        assert_eq!(report.visited, 1);
    }

    #[test]
    fn test_scan_records_path_count() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, |_| {});
        write(&ctx.source_root(), "a.txt", "a", 100);
        write(&ctx.source_root(), "b.txt", "b", 100);

        Scanner::new(&ctx).scan().unwrap();
        assert_eq!(ctx.state.expected_path_count(&ctx.source_root()), Some(2));
    }
}
