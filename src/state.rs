//! State Management - small JSON files under the state directory
//!
//! This module provides persistent storage for:
//! - Expected path counts per source tree (sizes progress reporting only)
//! - The location of the tag sidecar used when extended attributes are unavailable
//!
//! Nothing stored here is correctness-bearing except the tag sidecar.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PATH_COUNTS_FILE: &str = "path_counts.json";
const TAG_SIDECAR_FILE: &str = "tags.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PathCounts {
    #[serde(default)]
    counts: BTreeMap<String, u64>,
}

/// State directory manager
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open the state directory, creating it if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create state directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the JSON sidecar holding tags
    pub fn tag_sidecar_path(&self) -> PathBuf {
        self.root.join(TAG_SIDECAR_FILE)
    }

    /// Expected number of entries for a scan of `source`, if one was recorded
    ///
    /// Unreadable or corrupt files count as "no estimate".
    pub fn expected_path_count(&self, source: &Path) -> Option<u64> {
        let counts = self.read_counts();
        counts.counts.get(&source.to_string_lossy().into_owned()).copied()
    }

    /// Record the number of entries the last scan of `source` visited
    pub fn record_path_count(&self, source: &Path, count: u64) -> Result<()> {
        let mut counts = self.read_counts();
        counts
            .counts
            .insert(source.to_string_lossy().into_owned(), count);

        let path = self.root.join(PATH_COUNTS_FILE);
        let content = serde_json::to_string_pretty(&counts).context("Failed to serialize path counts")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        debug!("Recorded {} expected paths for {}", count, source.display());
        Ok(())
    }

    fn read_counts(&self) -> PathCounts {
        let path = self.root.join(PATH_COUNTS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring corrupt path counts at {}: {}", path.display(), e);
                PathCounts::default()
            }),
            Err(_) => PathCounts::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_directory() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path().join("state")).unwrap();
        assert!(store.root().is_dir());
        assert_eq!(store.tag_sidecar_path(), temp.path().join("state/tags.json"));
    }

    #[test]
    fn test_path_count_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();
        let source = Path::new("/home/user");

        assert_eq!(store.expected_path_count(source), None);

        store.record_path_count(source, 1234).unwrap();
        store.record_path_count(Path::new("/other"), 5).unwrap();

        assert_eq!(store.expected_path_count(source), Some(1234));
        assert_eq!(store.expected_path_count(Path::new("/other")), Some(5));
    }

    #[test]
    fn test_corrupt_counts_are_ignored() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();
        std::fs::write(temp.path().join(PATH_COUNTS_FILE), "not json").unwrap();

        assert_eq!(store.expected_path_count(Path::new("/home/user")), None);
        store.record_path_count(Path::new("/home/user"), 7).unwrap();
        assert_eq!(store.expected_path_count(Path::new("/home/user")), Some(7));
    }
}
