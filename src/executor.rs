//! Sync executor - drives the external sync tool and parses its status output

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::changes::{parse_status_line, Change, ChangeKind, Changes};
use crate::config::ToolConfig;
use crate::context::CycleContext;
use crate::error::SyncError;
use crate::filter::{overlap, FilterSet};
use crate::tags::MTIME_TAG;

const PROGRESS_EVERY: usize = 5_000;

/// Tool subcommand for one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Compare only, with combined status on stdout
    Check,
    /// One-way copy; never deletes
    Copy,
    /// Make dest identical to source, deletions included
    Sync,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Check => "check",
            Action::Copy => "copy",
            Action::Sync => "sync",
        }
    }
}

/// Command line construction and process handling for an rclone-compatible binary
#[derive(Debug, Clone)]
pub struct SyncTool {
    binary: String,
    retries: u32,
    retries_sleep: String,
    checkers: usize,
    transfers: usize,
}

impl SyncTool {
    pub fn from_config(config: &ToolConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            retries: config.retries,
            retries_sleep: config.retries_sleep.clone(),
            checkers: config.checkers,
            transfers: config.transfers,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn args(&self, action: Action, filter_file: &Path, source: &Path, dest: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![action.as_str().into()];
        if action == Action::Check {
            args.push("--combined".into());
            args.push("-".into());
        }
        args.push("--filter-from".into());
        args.push(filter_file.into());
        for (flag, value) in [
            ("--retries", self.retries.to_string()),
            ("--retries-sleep", self.retries_sleep.clone()),
            ("--checkers", self.checkers.to_string()),
            ("--transfers", self.transfers.to_string()),
            ("--order-by", "size,descending".to_string()),
        ] {
            args.push(flag.into());
            args.push(value.into());
        }
        args.push(source.into());
        args.push(dest.into());
        args
    }

    /// Run the tool, collecting its non-empty stdout lines
    pub async fn run_lines(&self, args: &[OsString]) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        self.run_each(args, None, |line| lines.push(line)).await?;
        Ok(lines)
    }

    /// Run the tool, handing each non-empty stdout line to `on_line` as it arrives
    ///
    /// stderr is drained concurrently and only surfaced when the tool exits
    /// non-zero without printing anything on stdout. `expected` sizes the
    /// progress log. Returns the number of lines received.
    pub async fn run_each<F>(&self, args: &[OsString], expected: Option<u64>, mut on_line: F) -> Result<usize>
    where
        F: FnMut(String),
    {
        debug!("Running {} {:?}", self.binary, args);

        let mut child = AsyncCommand::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute {}", self.binary))?;

        let stdout = child.stdout.take().context("Tool stdout was not captured")?;
        let stderr = child.stderr.take().context("Tool stderr was not captured")?;

        let drain = tokio::spawn(async move {
            let mut segments = BufReader::new(stderr).split(b'\n');
            let mut collected = Vec::new();
            while let Ok(Some(segment)) = segments.next_segment().await {
                collected.push(decode_line(&segment));
            }
            collected
        });

        let mut received = 0;
        let mut segments = BufReader::new(stdout).split(b'\n');
        while let Some(segment) = segments
            .next_segment()
            .await
            .with_context(|| format!("Failed to read output of {}", self.binary))?
        {
            let line = decode_line(&segment);
            if line.is_empty() {
                continue;
            }
            on_line(line);
            received += 1;
            if received % PROGRESS_EVERY == 0 {
                self.log_progress(received, expected);
            }
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", self.binary))?;
        let stderr = drain.await.unwrap_or_default();

        if !status.success() {
            if received == 0 {
                return Err(SyncError::ToolInvocation {
                    tool: self.binary.clone(),
                    status: status.to_string(),
                    stderr,
                }
                .into());
            }
            // check exits non-zero whenever it found differences
            debug!("{} exited with {} after {} lines", self.binary, status, received);
        }

        Ok(received)
    }

    fn log_progress(&self, received: usize, expected: Option<u64>) {
        match expected {
            Some(expected) if expected > 0 => {
                let percent = (received as f64 / expected as f64 * 100.0).min(100.0);
                info!("{} of ~{} lines received from {} ({:.0}%)", received, expected, self.binary, percent);
            }
            _ => debug!("{} lines received from {}", received, self.binary),
        }
    }
}

fn decode_line(segment: &[u8]) -> String {
    let line = String::from_utf8_lossy(segment);
    line.strip_suffix('\r').unwrap_or(&*line).to_string()
}

/// Status and push operations for one cycle
pub struct Executor<'a> {
    ctx: &'a CycleContext,
    tool: SyncTool,
}

impl<'a> Executor<'a> {
    pub fn new(ctx: &'a CycleContext) -> Self {
        Self {
            ctx,
            tool: SyncTool::from_config(&ctx.config.tool),
        }
    }

    /// Created, modified and deleted paths between `source` and `dest`
    ///
    /// `None` compares everything the path rules include; `Some` restricts the
    /// comparison to the given relative paths, and an empty slice short-circuits.
    /// Preserved paths are tagged (when `dest` is the local mirror) and copied
    /// again so both sides end up with the same timestamps.
    pub async fn status(&self, source: &Path, dest: &Path, paths: Option<&[PathBuf]>) -> Result<Changes> {
        let filters = match paths {
            Some([]) => {
                debug!("No candidate paths, skipping status");
                return Ok(Changes::default());
            }
            Some(paths) => FilterSet::for_paths(paths, overlap(source, dest).as_deref())?,
            None => FilterSet::for_rules(&self.ctx.rules, overlap(source, dest).as_deref())?,
        };

        let expected = match paths {
            Some(paths) => Some(paths.len() as u64),
            None => self.ctx.expected_paths,
        };

        info!("Checking {} against {}", source.display(), dest.display());
        let mut changes = Vec::new();
        let mut malformed = Vec::new();
        self.invoke(Action::Check, &filters, source, dest, expected, |line| match parse_status_line(&line) {
            Some((kind, path)) => changes.push(Change {
                kind,
                path: PathBuf::from(path),
                source: source.join(path),
                dest: dest.join(path),
            }),
            None => malformed.push(line),
        })
        .await?;
        if !malformed.is_empty() {
            return Err(SyncError::MalformedFilterRule { rules: malformed }.into());
        }

        let preserved: Vec<&Change> = changes.iter().filter(|c| c.kind == ChangeKind::Preserved).collect();
        if !preserved.is_empty() {
            self.homogenize(source, dest, &preserved).await?;
        }

        let changes = Changes::new(changes);
        info!(
            "{} created, {} modified, {} deleted",
            changes.count(ChangeKind::Created),
            changes.count(ChangeKind::Modified),
            changes.count(ChangeKind::Deleted)
        );
        Ok(changes)
    }

    /// Mirror the given relative paths from `source` into `dest`, deletions included
    pub async fn push(&self, source: &Path, dest: &Path, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            debug!("Nothing to push to {}", dest.display());
            return Ok(());
        }

        let filters = FilterSet::for_paths(paths, overlap(source, dest).as_deref())?;
        info!("Pushing {} paths to {}", paths.len(), dest.display());
        self.invoke(Action::Sync, &filters, source, dest, Some(paths.len() as u64), |line| {
            debug!("sync: {}", line)
        })
        .await?;

        if dest == self.ctx.cache_root() {
            for path in paths {
                self.ctx
                    .tags
                    .clear(&dest.join(path), MTIME_TAG)
                    .with_context(|| format!("Failed to clear mtime tag of {}", path.display()))?;
            }
        }
        Ok(())
    }

    async fn homogenize(&self, source: &Path, dest: &Path, preserved: &[&Change]) -> Result<()> {
        if dest == self.ctx.cache_root() {
            for change in preserved {
                let modified = match std::fs::metadata(&change.dest).and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(e) => {
                        warn!("Cannot read mtime of {}: {}", change.dest.display(), e);
                        continue;
                    }
                };
                if self.ctx.tags.tag_mtime_if_absent(&change.dest, modified)? {
                    debug!("Tagged original mtime of {}", change.path.display());
                }
            }
        }

        let paths: Vec<PathBuf> = preserved.iter().map(|change| change.path.clone()).collect();
        let filters = FilterSet::for_paths(&paths, overlap(source, dest).as_deref())?;
        debug!("Homogenizing timestamps of {} preserved paths", paths.len());
        self.invoke(Action::Copy, &filters, source, dest, Some(paths.len() as u64), |line| {
            debug!("copy: {}", line)
        })
        .await?;
        Ok(())
    }

    async fn invoke<F>(
        &self,
        action: Action,
        filters: &FilterSet,
        source: &Path,
        dest: &Path,
        expected: Option<u64>,
        on_line: F,
    ) -> Result<usize>
    where
        F: FnMut(String),
    {
        let filter_file = filters.write_temp()?;
        let args = self.tool.args(action, filter_file.path(), source, dest);
        self.tool
            .run_each(&args, expected, on_line)
            .await
            .with_context(|| format!("{} {} failed", self.tool.binary(), action.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> SyncTool {
        SyncTool::from_config(&ToolConfig::default())
    }

    #[test]
    fn test_check_args() {
        let args = tool().args(Action::Check, Path::new("/tmp/f.txt"), Path::new("/src"), Path::new("/dst"));
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "check",
                "--combined",
                "-",
                "--filter-from",
                "/tmp/f.txt",
                "--retries",
                "5",
                "--retries-sleep",
                "10s",
                "--checkers",
                "16",
                "--transfers",
                "4",
                "--order-by",
                "size,descending",
                "/src",
                "/dst",
            ]
        );
    }

    #[test]
    fn test_copy_and_sync_have_no_combined_report() {
        for action in [Action::Copy, Action::Sync] {
            let args = tool().args(action, Path::new("f"), Path::new("a"), Path::new("b"));
            assert_eq!(args[0], OsString::from(action.as_str()));
            assert!(!args.contains(&OsString::from("--combined")));
        }
    }

    #[test]
    fn test_decode_line_strips_carriage_return() {
        assert_eq!(decode_line(b"+ a.txt\r"), "+ a.txt");
        assert_eq!(decode_line(b"= \xffb"), "= \u{fffd}b");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_lines_streams_stdout() {
        let tool = SyncTool {
            binary: "sh".to_string(),
            ..tool()
        };
        let args: Vec<OsString> = vec!["-c".into(), "printf '+ a\\n\\n* b\\n'; echo noise >&2".into()];
        assert_eq!(tool.run_lines(&args).await.unwrap(), vec!["+ a", "* b"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_each_sees_lines_before_exit() {
        let tool = SyncTool {
            binary: "sh".to_string(),
            ..tool()
        };
        let marker = tempfile::NamedTempFile::new().unwrap();
        let script = format!("echo '+ a'; sleep 1; echo done > '{}'; echo '* b'", marker.path().display());
        let args: Vec<OsString> = vec!["-c".into(), script.into()];

        // The first line is handled while the tool is still sleeping
        let mut seen = Vec::new();
        let received = tool
            .run_each(&args, Some(2), |line| {
                let finished = std::fs::read_to_string(marker.path()).unwrap_or_default();
                seen.push((line, finished.trim().to_string()));
            })
            .await
            .unwrap();

        assert_eq!(received, 2);
        assert_eq!(
            seen,
            vec![("+ a".to_string(), String::new()), ("* b".to_string(), "done".to_string())]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_without_output_surfaces_stderr() {
        let tool = SyncTool {
            binary: "sh".to_string(),
            ..tool()
        };
        let args: Vec<OsString> = vec!["-c".into(), "echo boom >&2; exit 3".into()];
        let err = tool.run_lines(&args).await.unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::ToolInvocation { stderr, .. }) => assert_eq!(stderr, &vec!["boom".to_string()]),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_with_output_is_kept() {
        let tool = SyncTool {
            binary: "sh".to_string(),
            ..tool()
        };
        let args: Vec<OsString> = vec!["-c".into(), "echo '* a'; exit 1".into()];
        assert_eq!(tool.run_lines(&args).await.unwrap(), vec!["* a"]);
    }
}
