//! Volatility checkers
//!
//! A checker declares that some byte-level differences in one specific file
//! do not warrant a backup. It reduces the file to a hash of the content that
//! matters; two files with equal relevant hashes are treated as unchanged.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

use crate::config::CheckerConfig;
use crate::entry::Entry;

const MISSING: &str = "missing";

/// Hash of the semantically meaningful part of a file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelevantHash(String);

impl RelevantHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    /// Sentinel for a file that does not exist
    pub fn missing() -> Self {
        Self(MISSING.to_string())
    }

    pub fn is_missing(&self) -> bool {
        self.0 == MISSING
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelevantHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait VolatilityChecker: Send + Sync {
    /// Hash of only the relevant content of the file at `path`
    fn relevant_hash(&self, path: &Path) -> Result<RelevantHash>;
}

/// Bracket-sectioned text with volatile sections or lines dropped before hashing
pub struct SectionFilteredChecker {
    ignore_sections: Vec<String>,
    ignore_substrings: Vec<String>,
}

impl SectionFilteredChecker {
    pub fn new(ignore_sections: Vec<String>, ignore_substrings: Vec<String>) -> Self {
        Self {
            ignore_sections,
            ignore_substrings,
        }
    }

    /// Text that remains once ignored sections and lines are removed
    pub fn relevant_text(&self, content: &str) -> String {
        let mut kept = Vec::new();
        let mut skipping = false;

        for line in content.lines() {
            if let Some(section) = section_name(line) {
                skipping = self.ignore_sections.iter().any(|ignored| ignored == section);
            }
            if skipping {
                continue;
            }
            if self.ignore_substrings.iter().any(|needle| line.contains(needle.as_str())) {
                continue;
            }
            kept.push(line);
        }

        kept.join("\n")
    }
}

fn section_name(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .map(str::trim)
}

impl VolatilityChecker for SectionFilteredChecker {
    fn relevant_hash(&self, path: &Path) -> Result<RelevantHash> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RelevantHash::missing()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let content = String::from_utf8_lossy(&bytes);
        Ok(RelevantHash::of(self.relevant_text(&content).as_bytes()))
    }
}

/// Relevant content comes from an external query rather than the file bytes
///
/// On the live side the query runs and its hash is written to `hash_relative`
/// so the mirror receives it. On the mirror side the stored hash is read back.
pub struct ExternalQueryChecker {
    relative: PathBuf,
    hash_relative: PathBuf,
    command: Vec<String>,
    live_root: PathBuf,
}

impl ExternalQueryChecker {
    pub fn new(relative: PathBuf, hash_relative: PathBuf, command: Vec<String>, live_root: PathBuf) -> Self {
        Self {
            relative,
            hash_relative,
            command,
            live_root,
        }
    }

    /// Query output; a missing or failing tool means "no entries"
    fn query(&self) -> Vec<u8> {
        let Some((program, args)) = self.command.split_first() else {
            return Vec::new();
        };

        match Command::new(program).args(args).output() {
            Ok(output) if output.status.success() => output.stdout,
            Ok(output) => {
                debug!("{} exited with {}, treating as no entries", program, output.status);
                Vec::new()
            }
            Err(e) => {
                debug!("{} unavailable ({}), treating as no entries", program, e);
                Vec::new()
            }
        }
    }

    fn root_of<'p>(&self, path: &'p Path) -> Option<&'p Path> {
        let mut root = path;
        for _ in self.relative.components() {
            root = root.parent()?;
        }
        Some(root)
    }
}

impl VolatilityChecker for ExternalQueryChecker {
    fn relevant_hash(&self, path: &Path) -> Result<RelevantHash> {
        if !path.exists() {
            return Ok(RelevantHash::missing());
        }
        let root = self
            .root_of(path)
            .with_context(|| format!("{} is not a {} path", path.display(), self.relative.display()))?;
        let hash_path = root.join(&self.hash_relative);

        if root == self.live_root {
            let hash = RelevantHash::of(&self.query());
            let stored = std::fs::read_to_string(&hash_path).unwrap_or_default();
            if stored.trim() != hash.as_str() {
                if let Some(parent) = hash_path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                std::fs::write(&hash_path, hash.as_str())
                    .with_context(|| format!("Failed to write {}", hash_path.display()))?;
            }
            Ok(hash)
        } else {
            match std::fs::read_to_string(&hash_path) {
                Ok(stored) => Ok(RelevantHash(stored.trim().to_string())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelevantHash::missing()),
                Err(e) => Err(e).with_context(|| format!("Failed to read {}", hash_path.display())),
            }
        }
    }
}

/// Startup-time table from relative path to checker
#[derive(Default)]
pub struct CheckerRegistry {
    checkers: HashMap<PathBuf, Box<dyn VolatilityChecker>>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(configs: &[CheckerConfig], live_root: &Path) -> Self {
        let mut registry = Self::new();
        for config in configs {
            match config {
                CheckerConfig::Sections {
                    path,
                    ignore_sections,
                    ignore_substrings,
                } => registry.register(
                    path,
                    Box::new(SectionFilteredChecker::new(ignore_sections.clone(), ignore_substrings.clone())),
                ),
                CheckerConfig::External {
                    path,
                    hash_path,
                    command,
                } => registry.register(
                    path,
                    Box::new(ExternalQueryChecker::new(
                        PathBuf::from(path),
                        PathBuf::from(hash_path),
                        command.clone(),
                        live_root.to_path_buf(),
                    )),
                ),
            }
        }
        registry
    }

    pub fn register(&mut self, relative: impl Into<PathBuf>, checker: Box<dyn VolatilityChecker>) {
        let relative = relative.into();
        if self.checkers.insert(relative.clone(), checker).is_some() {
            warn!("Replacing volatility checker for {}", relative.display());
        }
    }

    pub fn get(&self, relative: &Path) -> Option<&dyn VolatilityChecker> {
        self.checkers.get(relative).map(|checker| checker.as_ref())
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }

    /// `None` when no checker is registered for the entry
    pub fn relevant_content_unchanged(&self, entry: &Entry) -> Result<Option<bool>> {
        let Some(checker) = self.get(&entry.relative) else {
            return Ok(None);
        };
        let source = checker.relevant_hash(&entry.source)?;
        let dest = checker.relevant_hash(&entry.dest)?;
        debug!("Relevant hashes for {}: {} / {}", entry.relative.display(), source, dest);
        Ok(Some(source == dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SETTINGS_A: &str = "[General]\ntheme=dark\n[History]\nsearch=foo\n[Session]\nlast_opened=/tmp/a\nwindow=max\n";
    const SETTINGS_B: &str = "[General]\ntheme=dark\n[History]\nsearch=bar\nsearch=baz\n[Session]\nlast_opened=/tmp/b\nwindow=max\n";

    fn settings_checker() -> SectionFilteredChecker {
        SectionFilteredChecker::new(vec!["History".to_string()], vec!["last_opened=".to_string()])
    }

    #[test]
    fn test_relevant_text_drops_sections_and_lines() {
        let text = settings_checker().relevant_text(SETTINGS_A);
        assert_eq!(text, "[General]\ntheme=dark\n[Session]\nwindow=max");
    }

    #[test]
    fn test_section_checker_equal_for_volatile_differences() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.ini");
        let b = temp.path().join("b.ini");
        std::fs::write(&a, SETTINGS_A).unwrap();
        std::fs::write(&b, SETTINGS_B).unwrap();

        let checker = settings_checker();
        assert_eq!(checker.relevant_hash(&a).unwrap(), checker.relevant_hash(&b).unwrap());

        std::fs::write(&b, SETTINGS_B.replace("theme=dark", "theme=light")).unwrap();
        assert_ne!(checker.relevant_hash(&a).unwrap(), checker.relevant_hash(&b).unwrap());
    }

    #[test]
    fn test_missing_file_hash() {
        let temp = TempDir::new().unwrap();
        let hash = settings_checker().relevant_hash(&temp.path().join("absent.ini")).unwrap();
        assert!(hash.is_missing());
        assert_eq!(hash, RelevantHash::missing());
    }

    #[test]
    fn test_hash_is_lowercase_sha256_hex() {
        assert_eq!(
            RelevantHash::of(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(!RelevantHash::of(b"").is_missing());
    }

    #[test]
    fn test_external_checker_missing_tool_means_no_entries() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("live");
        let mirror = temp.path().join("mirror");
        for root in [&live, &mirror] {
            std::fs::create_dir_all(root.join("keyrings")).unwrap();
            std::fs::write(root.join("keyrings/login.keyring"), b"\x00\x01binary").unwrap();
        }

        let checker = ExternalQueryChecker::new(
            PathBuf::from("keyrings/login.keyring"),
            PathBuf::from("keyrings/login.hash"),
            vec!["mirrorsync-definitely-not-installed".to_string()],
            live.clone(),
        );

        let live_hash = checker.relevant_hash(&live.join("keyrings/login.keyring")).unwrap();
        assert_eq!(live_hash, RelevantHash::of(b""));
        // The query hash is stored beside the tracked file
        let stored = std::fs::read_to_string(live.join("keyrings/login.hash")).unwrap();
        assert_eq!(stored, live_hash.as_str());

        // Mirror has no stored hash yet
        let mirror_hash = checker.relevant_hash(&mirror.join("keyrings/login.keyring")).unwrap();
        assert!(mirror_hash.is_missing());

        std::fs::write(mirror.join("keyrings/login.hash"), &stored).unwrap();
        let mirror_hash = checker.relevant_hash(&mirror.join("keyrings/login.keyring")).unwrap();
        assert_eq!(mirror_hash, live_hash);
    }

    #[cfg(unix)]
    #[test]
    fn test_external_checker_hashes_query_output() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("live");
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join("store.db"), b"opaque").unwrap();

        let checker = ExternalQueryChecker::new(
            PathBuf::from("store.db"),
            PathBuf::from("store.hash"),
            vec!["echo".to_string(), "entry-one".to_string()],
            live.clone(),
        );

        let hash = checker.relevant_hash(&live.join("store.db")).unwrap();
        assert_eq!(hash, RelevantHash::of(b"entry-one\n"));
    }

    #[test]
    fn test_registry_from_config() {
        let configs = vec![CheckerConfig::Sections {
            path: ".config/app/settings.ini".to_string(),
            ignore_sections: vec!["History".to_string()],
            ignore_substrings: Vec::new(),
        }];
        let registry = CheckerRegistry::from_config(&configs, Path::new("/home/user"));

        assert_eq!(registry.len(), 1);
        assert!(registry.get(Path::new(".config/app/settings.ini")).is_some());
        assert!(registry.get(Path::new(".config/app/other.ini")).is_none());
    }
}
