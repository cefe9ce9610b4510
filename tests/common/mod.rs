/// Common test utilities and helpers for mirrorsync tests

use filetime::{set_file_mtime, FileTime};
use mirrorsync::config::{Config, TagBackendKind};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Minimal rclone stand-in understanding `+ /<path>` and `+ /**` filter lines
///
/// check prints combined status lines, copy and sync transfer with `cp -p`,
/// sync also deletes. Every invocation appends its action to the log file.
const FAKE_TOOL: &str = r#"#!/bin/sh
action="$1"; shift
echo "$action" >> "__LOG__"
filter=""
while [ $# -gt 2 ]; do
  case "$1" in
    --filter-from) filter="$2"; shift 2 ;;
    --combined|--retries|--retries-sleep|--checkers|--transfers|--order-by) shift 2 ;;
    *) shift ;;
  esac
done
src="$1"; dst="$2"

paths=$(mktemp)
while IFS= read -r line; do
  case "$line" in
    "+ /**")
      { [ -d "$src" ] && (cd "$src" && find . -type f); [ -d "$dst" ] && (cd "$dst" && find . -type f); } | sed 's|^\./||' >> "$paths" ;;
    "+ /"*) printf '%s\n' "${line#+ /}" >> "$paths" ;;
  esac
done < "$filter"

differences=0
for path in $(sort -u "$paths"); do
  case "$action" in
    check)
      if [ -f "$src/$path" ] && [ -f "$dst/$path" ]; then
        if cmp -s "$src/$path" "$dst/$path"; then echo "= $path"; else echo "* $path"; differences=1; fi
      elif [ -f "$src/$path" ]; then echo "+ $path"; differences=1
      elif [ -f "$dst/$path" ]; then echo "- $path"; differences=1
      fi ;;
    copy|sync)
      if [ -f "$src/$path" ]; then
        mkdir -p "$(dirname "$dst/$path")"
        cp -p "$src/$path" "$dst/$path"
      elif [ "$action" = sync ] && [ -f "$dst/$path" ]; then
        rm -f "$dst/$path"
      fi ;;
  esac
done
rm -f "$paths"
exit $differences
"#;

/// Source, mirror, remote and state directories plus a fake sync tool
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub source: PathBuf,
    pub cache: PathBuf,
    pub remote: PathBuf,
    pub state: PathBuf,
    pub tool: PathBuf,
    pub log: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().to_path_buf();
        let env = Self {
            source: root.join("source"),
            cache: root.join("cache"),
            remote: root.join("remote"),
            state: root.join("state"),
            tool: root.join("fake-rclone"),
            log: root.join("invocations.log"),
            temp_dir,
        };

        for dir in [&env.source, &env.cache, &env.remote, &env.state] {
            std::fs::create_dir_all(dir).expect("Failed to create test directory");
        }

        let script = FAKE_TOOL.replace("__LOG__", &env.log.to_string_lossy());
        std::fs::write(&env.tool, script).expect("Failed to write fake tool");
        std::fs::set_permissions(&env.tool, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to make fake tool executable");

        env
    }

    /// Configuration wired to this environment, sidecar tags, no excludes
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.source = self.source.to_string_lossy().into_owned();
        config.cache = self.cache.to_string_lossy().into_owned();
        config.dest = self.remote.to_string_lossy().into_owned();
        config.state_directory = self.state.to_string_lossy().into_owned();
        config.excludes = Vec::new();
        config.tags.backend = TagBackendKind::Sidecar;
        config.tool.binary = self.tool.to_string_lossy().into_owned();
        config
    }

    pub fn write_config_file(&self, extra_yaml: &str) -> PathBuf {
        let path = self.temp_dir.path().join("config.yml");
        let content = format!(
            "source: \"{}\"\ncache: \"{}\"\ndest: \"{}\"\nstate_directory: \"{}\"\ntags:\n  backend: sidecar\n{}",
            self.source.display(),
            self.cache.display(),
            self.remote.display(),
            self.state.display(),
            extra_yaml
        );
        std::fs::write(&path, content).expect("Failed to write test config");
        path
    }

    /// Write a file below `root` with a fixed mtime
    pub fn write(&self, root: &Path, relative: &str, content: &str, secs: i64) -> PathBuf {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().expect("file has a parent")).expect("Failed to create parent");
        std::fs::write(&path, content).expect("Failed to write test file");
        set_file_mtime(&path, FileTime::from_unix_time(secs, 0)).expect("Failed to set mtime");
        path
    }

    /// Actions the fake tool was invoked with, in order
    pub fn invocations(&self) -> Vec<String> {
        match std::fs::read_to_string(&self.log) {
            Ok(content) => content.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn clear_invocations(&self) {
        let _ = std::fs::remove_file(&self.log);
    }
}

pub fn mtime(path: &Path) -> FileTime {
    FileTime::from_last_modification_time(&std::fs::metadata(path).expect("Failed to stat"))
}

/// Relative paths of a change set, as strings, in report order
pub fn change_paths(changes: &mirrorsync::Changes) -> Vec<(char, String)> {
    changes
        .iter()
        .map(|change| (change.kind.symbol(), change.path.to_string_lossy().into_owned()))
        .collect()
}
