//! Change records parsed from the sync tool's combined status output

use std::fmt;
use std::path::PathBuf;

/// Ordering groups reports: created, then modified, then deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    /// Identical content; consumed internally, never reported
    Preserved,
}

impl ChangeKind {
    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            '+' => Some(ChangeKind::Created),
            '*' => Some(ChangeKind::Modified),
            '-' => Some(ChangeKind::Deleted),
            '=' => Some(ChangeKind::Preserved),
            _ => None,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            ChangeKind::Created => '+',
            ChangeKind::Modified => '*',
            ChangeKind::Deleted => '-',
            ChangeKind::Preserved => '=',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Preserved => "preserved",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse `"<symbol> <path>"`; `None` for anything else
pub fn parse_status_line(line: &str) -> Option<(ChangeKind, &str)> {
    let mut chars = line.chars();
    let kind = ChangeKind::from_symbol(chars.next()?)?;
    if chars.next()? != ' ' {
        return None;
    }
    let path = &line[2..];
    if path.is_empty() {
        return None;
    }
    Some((kind, path))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Change {
    pub kind: ChangeKind,
    /// Relative path
    pub path: PathBuf,
    pub source: PathBuf,
    pub dest: PathBuf,
}

/// Actionable changes, sorted by `(kind, path)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    changes: Vec<Change>,
}

impl Changes {
    /// Keep created/modified/deleted entries and sort them for grouped reporting
    pub fn new(changes: Vec<Change>) -> Self {
        let mut changes: Vec<Change> = changes
            .into_iter()
            .filter(|change| change.kind != ChangeKind::Preserved)
            .collect();
        changes.sort();
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    pub fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(move |change| change.kind == kind)
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.of_kind(kind).count()
    }

    /// Relative paths of every change
    pub fn paths(&self) -> Vec<PathBuf> {
        self.changes.iter().map(|change| change.path.clone()).collect()
    }
}

impl IntoIterator for Changes {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl fmt::Display for Changes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current: Option<ChangeKind> = None;
        for change in &self.changes {
            if current != Some(change.kind) {
                writeln!(f, "{} ({}):", change.kind, self.count(change.kind))?;
                current = Some(change.kind);
            }
            writeln!(f, "  {} {}", change.kind.symbol(), change.path.display())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(kind: ChangeKind, path: &str) -> Change {
        Change {
            kind,
            path: PathBuf::from(path),
            source: PathBuf::from("/src").join(path),
            dest: PathBuf::from("/dst").join(path),
        }
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("+ new.txt"), Some((ChangeKind::Created, "new.txt")));
        assert_eq!(parse_status_line("* dir/a b.txt"), Some((ChangeKind::Modified, "dir/a b.txt")));
        assert_eq!(parse_status_line("- old.txt"), Some((ChangeKind::Deleted, "old.txt")));
        assert_eq!(parse_status_line("= same.txt"), Some((ChangeKind::Preserved, "same.txt")));
        assert_eq!(parse_status_line("!  error.txt"), None);
        assert_eq!(parse_status_line("+new.txt"), None);
        assert_eq!(parse_status_line("+ "), None);
        assert_eq!(parse_status_line(""), None);
        assert_eq!(parse_status_line("é x"), None);
    }

    #[test]
    fn test_changes_sorted_by_kind_then_path() {
        let changes = Changes::new(vec![
            change(ChangeKind::Deleted, "b"),
            change(ChangeKind::Created, "z"),
            change(ChangeKind::Preserved, "p"),
            change(ChangeKind::Modified, "m"),
            change(ChangeKind::Created, "a"),
        ]);

        let order: Vec<(ChangeKind, String)> = changes
            .iter()
            .map(|c| (c.kind, c.path.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(
            order,
            vec![
                (ChangeKind::Created, "a".to_string()),
                (ChangeKind::Created, "z".to_string()),
                (ChangeKind::Modified, "m".to_string()),
                (ChangeKind::Deleted, "b".to_string()),
            ]
        );
        assert_eq!(changes.count(ChangeKind::Preserved), 0);
    }

    #[test]
    fn test_display_groups_changes() {
        let changes = Changes::new(vec![
            change(ChangeKind::Modified, "0.txt"),
            change(ChangeKind::Created, "2.txt"),
            change(ChangeKind::Deleted, "1.txt"),
        ]);
        assert_eq!(
            changes.to_string(),
            "created (1):\n  + 2.txt\nmodified (1):\n  * 0.txt\ndeleted (1):\n  - 1.txt\n"
        );
    }
}
