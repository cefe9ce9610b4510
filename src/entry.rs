//! Candidate paths and the changed / excluded decision

use anyhow::{Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::context::CycleContext;

/// Which tree a path was discovered in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Dest,
}

/// One candidate path bound to both of its counterparts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    pub source: PathBuf,
    pub dest: PathBuf,
    pub relative: PathBuf,
    /// Whichever of `source` / `dest` the entry was discovered from
    pub existing: PathBuf,
}

impl Entry {
    /// Build an entry from a path found while walking one side
    pub fn discovered(side: Side, source_root: &Path, dest_root: &Path, existing: PathBuf) -> Result<Self> {
        let root = match side {
            Side::Source => source_root,
            Side::Dest => dest_root,
        };
        let relative = existing
            .strip_prefix(root)
            .with_context(|| format!("{} is not under {}", existing.display(), root.display()))?
            .to_path_buf();

        Ok(Self {
            source_root: source_root.to_path_buf(),
            dest_root: dest_root.to_path_buf(),
            source: source_root.join(&relative),
            dest: dest_root.join(&relative),
            relative,
            existing,
        })
    }

    /// Build an entry from a relative path, preferring the source side as `existing`
    pub fn for_relative(source_root: &Path, dest_root: &Path, relative: &Path) -> Self {
        let source = source_root.join(relative);
        let dest = dest_root.join(relative);
        let existing = if fs::symlink_metadata(&source).is_ok() {
            source.clone()
        } else {
            dest.clone()
        };

        Self {
            source_root: source_root.to_path_buf(),
            dest_root: dest_root.to_path_buf(),
            source,
            dest,
            relative: relative.to_path_buf(),
            existing,
        }
    }

    /// Lowercased extension of the relative path
    pub fn extension(&self) -> Option<String> {
        self.relative
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }

    /// A regular file whose mtime differs from its counterpart and that is not excluded
    pub fn is_changed(&self, ctx: &CycleContext) -> Result<bool> {
        let metadata = match fs::symlink_metadata(&self.existing) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", self.existing.display())),
        };
        if !metadata.is_file() {
            return Ok(false);
        }

        if modification_time(&self.source)? == modification_time(&self.dest)? {
            return Ok(false);
        }

        Ok(!self.exclude(ctx)?)
    }

    /// Whether policy or a volatility checker keeps this entry out of the transfer set
    ///
    /// When a checker reports unchanged relevant content, the destination mtime
    /// is moved to the source mtime so later scans do not flag it again.
    pub fn exclude(&self, ctx: &CycleContext) -> Result<bool> {
        let policy = &ctx.policy;

        if policy.excludes_browser(&self.relative) {
            debug!("Excluding browser configuration {}", self.relative.display());
            return Ok(true);
        }

        if let Some(tag) = &policy.exported_tag {
            if ctx.tags.get(&self.existing, &tag.name)?.as_deref() == Some(tag.value.as_str()) {
                debug!("Excluding exported {}", self.relative.display());
                return Ok(true);
            }
        }

        let extension = self.extension();
        if let Some(max_size) = policy.max_file_size {
            let size = fs::metadata(&self.existing)
                .with_context(|| format!("Failed to stat {}", self.existing.display()))?
                .len();
            if size > max_size && !policy.is_archive(extension.as_deref()) {
                debug!("Excluding {} ({} bytes over the size ceiling)", self.relative.display(), size);
                return Ok(true);
            }
        }

        if policy.is_partial(extension.as_deref()) {
            debug!("Excluding partial download {}", self.relative.display());
            return Ok(true);
        }

        if let Some(true) = ctx.checkers.relevant_content_unchanged(self)? {
            self.freshen()?;
            debug!("Relevant content of {} unchanged, freshened", self.relative.display());
            return Ok(true);
        }

        Ok(false)
    }

    /// Give the destination the source mtime without transferring content
    pub fn freshen(&self) -> Result<()> {
        let (Some(source_time), true) = (modification_time(&self.source)?, self.dest.is_file()) else {
            return Ok(());
        };
        set_file_mtime(&self.dest, source_time)
            .with_context(|| format!("Failed to set mtime on {}", self.dest.display()))
    }
}

/// Modification time, `None` for a missing path
pub fn modification_time(path: &Path) -> Result<Option<FileTime>> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(Some(FileTime::from_last_modification_time(&metadata))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}
