//! Path rule compilation
//!
//! Include and exclude trees from the configuration are flattened into an
//! ordered list of `(path, include)` rules. Deeper rules come first, so the
//! first rule covering a path is the most specific one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

use crate::error::SyncError;

/// Placeholder resolved to the most recently modified matching sibling on disk
pub const VERSION_TOKEN: &str = "{version}";

/// Substituted when no sibling matches a versioned name; never exists on disk
pub const MISSING_VERSION: &str = ".mirrorsync-missing-version";

/// A node of an include or exclude tree
///
/// A bare string is a leaf. A single-key map names a directory whose children
/// are listed below it. Names may contain `/` to skip intermediate levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleNode {
    Leaf(String),
    Branch(BTreeMap<String, Vec<RuleNode>>),
}

/// One compiled rule. An empty path is the root of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathRule {
    pub path: PathBuf,
    pub include: bool,
}

impl PathRule {
    pub fn is_root(&self) -> bool {
        self.path.as_os_str().is_empty()
    }

    /// Whether this rule applies to `relative`
    pub fn covers(&self, relative: &Path) -> bool {
        self.is_root() || relative.starts_with(&self.path)
    }
}

/// Ordered rule list, most specific first
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathRules {
    rules: Vec<PathRule>,
}

impl PathRules {
    pub fn new(rules: Vec<PathRule>) -> Self {
        Self { rules }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PathRule> {
        self.rules.iter()
    }

    pub fn as_slice(&self) -> &[PathRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule covering `relative`
    pub fn matching(&self, relative: &Path) -> Option<&PathRule> {
        self.rules.iter().find(|rule| rule.covers(relative))
    }

    /// Paths no rule covers are excluded
    pub fn is_included(&self, relative: &Path) -> bool {
        self.matching(relative).map(|rule| rule.include).unwrap_or(false)
    }

    /// Whether a walk has to enter `relative_dir` to reach included paths
    pub fn should_descend(&self, relative_dir: &Path) -> bool {
        self.is_included(relative_dir)
            || self
                .rules
                .iter()
                .any(|rule| rule.include && rule.path != relative_dir && rule.path.starts_with(relative_dir))
    }
}

struct Frontier<'n> {
    prefix: PathBuf,
    includes: Vec<&'n RuleNode>,
    excludes: Vec<&'n RuleNode>,
}

/// Compiles rule trees against a root directory on disk
pub struct RuleCompiler {
    root: PathBuf,
}

impl RuleCompiler {
    pub fn new(root: &Path) -> Self {
        Self {
            root: path_clean::clean(root),
        }
    }

    /// Flatten both trees level by level, then order deeper rules first
    pub fn compile(
        &self,
        includes: &[RuleNode],
        excludes: &[RuleNode],
        include_all_by_default: bool,
    ) -> Result<PathRules> {
        let mut levels: Vec<Vec<PathRule>> = Vec::new();
        let mut level = vec![Frontier {
            prefix: PathBuf::new(),
            includes: includes.iter().collect(),
            excludes: excludes.iter().collect(),
        }];

        while !level.is_empty() {
            let mut rules = Vec::new();
            let mut next = Vec::new();

            for frontier in level {
                let sides = frontier
                    .includes
                    .iter()
                    .map(|node| (*node, true))
                    .chain(frontier.excludes.iter().map(|node| (*node, false)));

                let mut children: BTreeMap<&str, (Vec<&RuleNode>, Vec<&RuleNode>)> = BTreeMap::new();
                for (node, include) in sides {
                    match node {
                        RuleNode::Leaf(name) => rules.push(PathRule {
                            path: self.resolve(&frontier.prefix, name)?,
                            include,
                        }),
                        RuleNode::Branch(map) => {
                            for (name, nodes) in map {
                                let slot = children.entry(name.as_str()).or_default();
                                if include {
                                    slot.0.extend(nodes.iter());
                                } else {
                                    slot.1.extend(nodes.iter());
                                }
                            }
                        }
                    }
                }

                for (name, (includes, excludes)) in children {
                    next.push(Frontier {
                        prefix: self.resolve(&frontier.prefix, name)?,
                        includes,
                        excludes,
                    });
                }
            }

            levels.push(rules);
            level = next;
        }

        let mut rules: Vec<PathRule> = levels.into_iter().rev().flatten().collect();
        // Names with slashes can put a shallow tree level deeper on disk
        rules.sort_by_key(|rule| Reverse(rule.path.components().count()));
        let mut seen = HashSet::new();
        rules.retain(|rule| seen.insert(rule.clone()));

        if !rules.iter().any(|rule| rule.include) {
            rules.push(PathRule {
                path: PathBuf::new(),
                include: include_all_by_default,
            });
        }

        debug!("Compiled {} path rules under {}", rules.len(), self.root.display());
        Ok(PathRules::new(rules))
    }

    fn resolve(&self, prefix: &Path, name: &str) -> Result<PathBuf> {
        let mut path = prefix.to_path_buf();

        for segment in name.split('/').filter(|segment| !segment.is_empty()) {
            let candidate = Path::new(segment);
            if !matches!(candidate.components().next(), Some(Component::Normal(_))) {
                return Err(SyncError::Config(format!("invalid rule name segment {:?} in {:?}", segment, name)).into());
            }

            if segment.contains(VERSION_TOKEN) {
                path.push(self.resolve_version(&path, segment)?);
            } else {
                path.push(segment);
            }
        }

        if path == prefix {
            return Err(SyncError::Config(format!("empty rule name under {:?}", prefix)).into());
        }

        self.resolve_symlink(path)
    }

    fn resolve_version(&self, parent: &Path, segment: &str) -> Result<String> {
        let (head, tail) = segment.split_once(VERSION_TOKEN).unwrap_or((segment, ""));
        let dir = self.root.join(parent);

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(MISSING_VERSION.to_string()),
        };

        let mut newest: Option<(SystemTime, String)> = None;
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.len() < head.len() + tail.len() || !name.starts_with(head) || !name.ends_with(tail) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
            if newest.as_ref().map(|(time, _)| modified > *time).unwrap_or(true) {
                newest = Some((modified, name));
            }
        }

        let resolved = newest
            .map(|(_, name)| name)
            .unwrap_or_else(|| MISSING_VERSION.to_string());
        debug!("Resolved {:?} in {} to {:?}", segment, dir.display(), resolved);
        Ok(resolved)
    }

    fn resolve_symlink(&self, path: PathBuf) -> Result<PathBuf> {
        let on_disk = self.root.join(&path);
        let is_symlink = fs::symlink_metadata(&on_disk)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            return Ok(path);
        }

        let link = fs::read_link(&on_disk)
            .with_context(|| format!("Failed to read symlink {}", on_disk.display()))?;
        let target = match on_disk.parent() {
            Some(parent) if link.is_relative() => path_clean::clean(parent.join(link)),
            _ => path_clean::clean(link),
        };

        match target.strip_prefix(&self.root) {
            Ok(relative) if !relative.as_os_str().is_empty() => {
                debug!("Rule {} follows symlink to {}", path.display(), relative.display());
                Ok(relative.to_path_buf())
            }
            _ => Err(SyncError::Config(format!(
                "symlink {} points outside {}: {}",
                path.display(),
                self.root.display(),
                target.display()
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    fn leaf(name: &str) -> RuleNode {
        RuleNode::Leaf(name.to_string())
    }

    fn branch(name: &str, children: Vec<RuleNode>) -> RuleNode {
        RuleNode::Branch(BTreeMap::from([(name.to_string(), children)]))
    }

    fn rule_set(rules: &PathRules) -> HashSet<(String, bool)> {
        rules
            .iter()
            .map(|rule| (rule.path.to_string_lossy().into_owned(), rule.include))
            .collect()
    }

    #[test]
    fn test_nested_trees_flatten_deepest_first() {
        let temp = TempDir::new().unwrap();
        let includes = vec![leaf("Documents"), branch(".config", vec![leaf("nvim"), leaf("git")])];
        let excludes = vec![branch("Documents", vec![leaf("tmp")]), branch(".config", vec![branch("nvim", vec![leaf("swap")])])];

        let rules = RuleCompiler::new(temp.path())
            .compile(&includes, &excludes, true)
            .unwrap();

        let expected: HashSet<(String, bool)> = [
            ("Documents", true),
            (".config/nvim", true),
            (".config/git", true),
            ("Documents/tmp", false),
            (".config/nvim/swap", false),
        ]
        .iter()
        .map(|(path, include)| (path.to_string(), *include))
        .collect();
        assert_eq!(rule_set(&rules), expected);

        let depths: Vec<usize> = rules.iter().map(|rule| rule.path.components().count()).collect();
        let mut sorted = depths.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(depths, sorted);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let includes = vec![branch("a", vec![leaf("b"), leaf("c")]), leaf("d")];
        let excludes = vec![branch("a", vec![leaf("c/e")])];
        let compiler = RuleCompiler::new(temp.path());

        let first = compiler.compile(&includes, &excludes, true).unwrap();
        let second = compiler.compile(&includes, &excludes, true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_includes_append_catch_all() {
        let temp = TempDir::new().unwrap();
        let compiler = RuleCompiler::new(temp.path());

        let rules = compiler.compile(&[], &[leaf(".cache")], true).unwrap();
        let last = rules.as_slice().last().unwrap();
        assert!(last.is_root());
        assert!(last.include);
        assert!(rules.is_included(Path::new("notes.txt")));
        assert!(!rules.is_included(Path::new(".cache/x")));

        let rules = compiler.compile(&[], &[], false).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(!rules.is_included(Path::new("notes.txt")));
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let temp = TempDir::new().unwrap();
        let rules = RuleCompiler::new(temp.path())
            .compile(&[branch(".config", vec![leaf("nvim")])], &[leaf(".config")], true)
            .unwrap();

        assert!(rules.is_included(Path::new(".config/nvim/init.lua")));
        assert!(!rules.is_included(Path::new(".config/other/file")));
        assert!(!rules.is_included(Path::new("unrelated")));
        assert!(rules.should_descend(Path::new(".config")));
        assert!(!rules.should_descend(Path::new(".config/other")));
        assert!(rules.should_descend(Path::new("")));
    }

    #[test]
    fn test_slash_names_skip_levels() {
        let temp = TempDir::new().unwrap();
        let rules = RuleCompiler::new(temp.path())
            .compile(&[leaf(".local/share/fonts")], &[], true)
            .unwrap();
        assert_eq!(rules.as_slice()[0].path, PathBuf::from(".local/share/fonts"));
        assert!(rules.should_descend(Path::new(".local")));
    }

    #[test]
    fn test_version_token_picks_newest_sibling() {
        let temp = TempDir::new().unwrap();
        let parent = temp.path().join(".app");
        for (name, secs) in [("app-1.0", 1_000), ("app-2.0", 3_000), ("app-1.5", 2_000), ("other", 9_000)] {
            let dir = parent.join(name);
            fs::create_dir_all(&dir).unwrap();
            set_file_mtime(&dir, FileTime::from_unix_time(secs, 0)).unwrap();
        }

        let rules = RuleCompiler::new(temp.path())
            .compile(&[branch(".app", vec![leaf("app-{version}")])], &[], true)
            .unwrap();
        assert_eq!(rules.as_slice()[0].path, PathBuf::from(".app/app-2.0"));
    }

    #[test]
    fn test_version_token_without_match_is_inert() {
        let temp = TempDir::new().unwrap();
        let rules = RuleCompiler::new(temp.path())
            .compile(&[leaf("tool-{version}")], &[], true)
            .unwrap();
        assert_eq!(rules.as_slice()[0].path, PathBuf::from(MISSING_VERSION));
        assert!(!temp.path().join(MISSING_VERSION).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_root_is_resolved() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("real/notes")).unwrap();
        std::os::unix::fs::symlink("real/notes", temp.path().join("notes")).unwrap();

        let rules = RuleCompiler::new(temp.path())
            .compile(&[leaf("notes")], &[], true)
            .unwrap();
        assert_eq!(rules.as_slice()[0].path, PathBuf::from("real/notes"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escaping_root_fails() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("escape")).unwrap();

        let err = RuleCompiler::new(temp.path())
            .compile(&[leaf("escape")], &[], true)
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Config(_))));
    }

    #[test]
    fn test_parent_segments_are_rejected() {
        let temp = TempDir::new().unwrap();
        let err = RuleCompiler::new(temp.path())
            .compile(&[leaf("../etc")], &[], true)
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Config(_))));
    }

    #[test]
    fn test_rule_nodes_from_yaml() {
        let yaml = r#"
- Documents
- .config:
    - nvim
    - git:
        - hooks
"#;
        let nodes: Vec<RuleNode> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(nodes[0], leaf("Documents"));
        assert_eq!(
            nodes[1],
            branch(".config", vec![leaf("nvim"), branch("git", vec![leaf("hooks")])])
        );
    }
}
