//! Filter files for the sync tool
//!
//! One rule per line, `+ /<escaped path>` or `- /<escaped path>`. Directory
//! rules carry an unescaped `/**` suffix. Every glob metacharacter inside a
//! path is escaped so no path can be read back as a pattern.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::SyncError;
use crate::rules::PathRules;

/// Characters with glob meaning in the filter grammar
pub const RESERVED: [char; 7] = ['\\', '[', ']', '*', '?', '{', '}'];

/// Suffix that makes a rule cover everything below a directory
pub const RECURSIVE_SUFFIX: &str = "/**";

/// Excludes every file not matched by an earlier rule
pub const CATCH_ALL: &str = "- *";

pub fn escape(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        if RESERVED.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Inverse of [`escape`]; an unescaped metacharacter makes the pattern ambiguous
pub fn unescape(pattern: &str) -> Result<String, SyncError> {
    let mut path = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => path.push(next),
                None => {
                    return Err(SyncError::MalformedFilterRule {
                        rules: vec![pattern.to_string()],
                    })
                }
            }
        } else if RESERVED.contains(&c) {
            return Err(SyncError::MalformedFilterRule {
                rules: vec![pattern.to_string()],
            });
        } else {
            path.push(c);
        }
    }

    Ok(path)
}

/// A single include or exclude line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    /// Relative path, `/`-separated, empty for the tree root
    pub path: String,
    pub include: bool,
    pub recursive: bool,
}

impl FilterRule {
    pub fn new(path: impl Into<String>, include: bool, recursive: bool) -> Self {
        Self {
            path: path.into(),
            include,
            recursive,
        }
    }

    /// Render the rule; paths with line breaks cannot be expressed
    pub fn to_line(&self) -> Result<String, SyncError> {
        let sign = if self.include { '+' } else { '-' };
        let suffix = if self.recursive { RECURSIVE_SUFFIX } else { "" };
        let line = if self.path.is_empty() {
            format!("{} /**", sign)
        } else {
            format!("{} /{}{}", sign, escape(&self.path), suffix)
        };

        if self.path.contains(is_line_break) {
            return Err(SyncError::MalformedFilterRule { rules: vec![line] });
        }
        Ok(line)
    }

    /// Parse a line produced by [`FilterRule::to_line`]
    pub fn parse(line: &str) -> Result<Self, SyncError> {
        let malformed = || SyncError::MalformedFilterRule {
            rules: vec![line.to_string()],
        };

        let (include, rest) = if let Some(rest) = line.strip_prefix("+ ") {
            (true, rest)
        } else if let Some(rest) = line.strip_prefix("- ") {
            (false, rest)
        } else {
            return Err(malformed());
        };
        let pattern = rest.strip_prefix('/').ok_or_else(malformed)?;

        if pattern == "**" {
            return Ok(Self::new("", include, true));
        }
        let (pattern, recursive) = match pattern.strip_suffix(RECURSIVE_SUFFIX) {
            Some(stripped) => (stripped, true),
            None => (pattern, false),
        };

        Ok(Self::new(unescape(pattern)?, include, recursive))
    }
}

/// Relative path of one root inside the other, when source and dest overlap on disk
pub fn overlap(source: &Path, dest: &Path) -> Option<PathBuf> {
    if source == dest {
        return None;
    }
    dest.strip_prefix(source)
        .or_else(|_| source.strip_prefix(dest))
        .ok()
        .map(Path::to_path_buf)
}

/// Ordered filter lines for one tool invocation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterSet {
    lines: Vec<String>,
}

impl FilterSet {
    /// Include exactly `paths`, nothing else
    pub fn for_paths(paths: &[PathBuf], overlap: Option<&Path>) -> Result<Self, SyncError> {
        let rules = paths
            .iter()
            .map(|path| FilterRule::new(slash_path(path), true, false))
            .collect::<Vec<_>>();
        Self::build(rules, overlap, true)
    }

    /// Translate compiled path rules; each covers a file or a whole directory
    pub fn for_rules(rules: &PathRules, overlap: Option<&Path>) -> Result<Self, SyncError> {
        let mut filter_rules = Vec::new();
        let mut includes_root = false;
        for rule in rules.iter() {
            let path = slash_path(&rule.path);
            if path.is_empty() {
                includes_root = rule.include;
                filter_rules.push(FilterRule::new("", rule.include, true));
            } else {
                filter_rules.push(FilterRule::new(path.clone(), rule.include, false));
                filter_rules.push(FilterRule::new(path, rule.include, true));
            }
        }
        Self::build(filter_rules, overlap, !includes_root)
    }

    fn build(rules: Vec<FilterRule>, overlap: Option<&Path>, catch_all: bool) -> Result<Self, SyncError> {
        let mut lines = Vec::with_capacity(rules.len() + 2);
        let mut malformed = Vec::new();

        if let Some(overlap) = overlap {
            match FilterRule::new(slash_path(overlap), false, true).to_line() {
                Ok(line) => lines.push(line),
                Err(SyncError::MalformedFilterRule { rules }) => malformed.extend(rules),
                Err(e) => return Err(e),
            }
        }

        for rule in rules {
            match rule.to_line() {
                Ok(line) => lines.push(line),
                Err(SyncError::MalformedFilterRule { rules }) => malformed.extend(rules),
                Err(e) => return Err(e),
            }
        }

        if !malformed.is_empty() {
            return Err(SyncError::MalformedFilterRule { rules: malformed });
        }
        if catch_all {
            lines.push(CATCH_ALL.to_string());
        }

        Ok(Self { lines })
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Write to a uniquely named temporary file, removed when dropped
    pub fn write_temp(&self) -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("mirrorsync-filter-")
            .suffix(".txt")
            .tempfile()
            .context("Failed to create filter file")?;
        for line in &self.lines {
            writeln!(file, "{}", line).context("Failed to write filter file")?;
        }
        file.flush().context("Failed to flush filter file")?;
        Ok(file)
    }
}

fn is_line_break(c: char) -> bool {
    c == '\n' || c == '\r'
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
