//! Remote listing - fetch and parse the precision-degraded remote inventory
//!
//! The remote reports each file's modification date only down to the minute
//! and without a year. Each listing line carries that date between two literal
//! delimiters, followed by the path.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, NaiveDateTime, Timelike, Utc};
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use crate::config::ListingConfig;
use crate::error::SyncError;

/// A modification time at remote granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteDate {
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
}

impl RemoteDate {
    pub fn new(month: u32, day: u32, hour: u32, minute: u32) -> Self {
        Self {
            month,
            day,
            hour,
            minute,
        }
    }

    /// Truncate a local timestamp the way the remote reports it
    pub fn from_system_time(time: SystemTime, utc: bool) -> Self {
        if utc {
            Self::from_datetime(&DateTime::<Utc>::from(time))
        } else {
            Self::from_datetime(&DateTime::<Local>::from(time))
        }
    }

    fn from_datetime<T: Datelike + Timelike>(time: &T) -> Self {
        Self::new(time.month(), time.day(), time.hour(), time.minute())
    }

    /// Parse a year-less date; a leap year is assumed so `Feb 29` is accepted
    pub fn parse(text: &str, format: &str) -> Option<Self> {
        let parsed = NaiveDateTime::parse_from_str(&format!("2000 {}", text.trim()), &format!("%Y {}", format)).ok()?;
        Some(Self::from_datetime(&parsed))
    }
}

/// One file reported by the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// Path relative to the remote root
    pub path: PathBuf,
    pub date: RemoteDate,
}

impl ListingEntry {
    /// Refuse paths that would leave the mirror once joined onto it
    pub fn validate(&self) -> Result<(), SyncError> {
        if is_contained(&self.path) {
            Ok(())
        } else {
            Err(SyncError::Listing(format!("path {:?} escapes the mirror", self.path)))
        }
    }
}

fn is_contained(path: &Path) -> bool {
    path.components().all(|component| matches!(component, Component::Normal(_)))
}

/// Extracts entries from listing text
#[derive(Debug, Clone)]
pub struct ListingParser {
    pattern: Regex,
    date_format: String,
}

impl ListingParser {
    pub fn new(date_open: &str, date_close: &str, date_format: &str) -> Result<Self> {
        let pattern = format!(
            "{}(?P<date>.*?){} ?(?P<path>.+)$",
            regex::escape(date_open),
            regex::escape(date_close)
        );
        let pattern = Regex::new(&pattern).context("Failed to build listing pattern")?;

        Ok(Self {
            pattern,
            date_format: date_format.to_string(),
        })
    }

    pub fn from_config(config: &ListingConfig) -> Result<Self> {
        Self::new(&config.date_open, &config.date_close, &config.date_format)
    }

    /// `Ok(None)` for lines without the delimiter pair
    pub fn parse_line(&self, line: &str) -> Result<Option<ListingEntry>, SyncError> {
        let Some(captures) = self.pattern.captures(line) else {
            return Ok(None);
        };
        let date_text = &captures["date"];
        let path = captures["path"].trim_start_matches('/');
        if path.is_empty() {
            return Ok(None);
        }

        let date = RemoteDate::parse(date_text, &self.date_format).ok_or_else(|| {
            SyncError::Listing(format!("unparsable date {:?} in line {:?}", date_text, line))
        })?;

        let entry = ListingEntry {
            path: PathBuf::from(path),
            date,
        };
        entry.validate()?;
        Ok(Some(entry))
    }

    /// Every entry of a listing; one unparsable date rejects the whole listing
    pub fn parse(&self, text: &str) -> Result<Vec<ListingEntry>, SyncError> {
        let mut entries = Vec::new();
        for line in text.lines() {
            if let Some(entry) = self.parse_line(line)? {
                entries.push(entry);
            }
        }
        debug!("Parsed {} listing entries", entries.len());
        Ok(entries)
    }
}

/// Where the remote listing comes from
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// The complete listing text; partial results are never returned
    async fn fetch(&self) -> Result<String>;

    /// Source name for display/logging
    fn source_name(&self) -> String;
}

/// Listing printed on stdout by a configured command
pub struct CommandListing {
    command: Vec<String>,
}

impl CommandListing {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl ListingSource for CommandListing {
    async fn fetch(&self) -> Result<String> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(SyncError::Listing("no listing command configured".to_string()).into());
        };

        info!("Fetching remote listing with {}", program);
        let output = AsyncCommand::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SyncError::Listing(format!("failed to execute {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::Listing(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            ))
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn source_name(&self) -> String {
        self.command.join(" ")
    }
}

/// Listing previously saved to a report file
pub struct FileListing {
    path: PathBuf,
}

impl FileListing {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ListingSource for FileListing {
    async fn fetch(&self) -> Result<String> {
        info!("Reading remote listing from {}", self.path.display());
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SyncError::Listing(format!("failed to read {}: {}", self.path.display(), e)).into())
    }

    fn source_name(&self) -> String {
        self.path.display().to_string()
    }
}
