//! Preflight checks for mirrorsync
//!
//! Verifies the sync tool, both local roots and tag storage before a cycle
//! touches anything.

use crate::config::{Config, TagBackendKind};
use crate::state::StateStore;
use crate::tags::TagStore;
use std::path::Path;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Sync tool on PATH
    pub tool: CheckResult,
    /// Source tree exists
    pub source_dir: CheckResult,
    /// Mirror can be created and written
    pub cache_dir: CheckResult,
    /// Tag storage backend (warning when falling back to the sidecar)
    pub tags: CheckResult,
    /// Remote listing command (warning only, reconcile can read a file instead)
    pub listing: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(config: &Config) -> Self {
        Self {
            tool: Self::check_tool(&config.tool.binary),
            source_dir: Self::check_source_dir(config),
            cache_dir: Self::check_cache_dir(config),
            tags: Self::check_tags(config),
            listing: Self::check_listing(config),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, check)| check.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, check)| check)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, check)| check)
            .filter(|r| r.is_warning)
            .collect()
    }

    fn check_tool(binary: &str) -> CheckResult {
        match std::process::Command::new(binary).arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                let first_line = version.lines().next().unwrap_or_default().trim().to_string();
                CheckResult::ok_with_details(format!("{} installed", binary), first_line)
            }
            Ok(_) => CheckResult::error(format!("{} --version failed", binary)),
            Err(_) => CheckResult::error_with_details(
                format!("{} not found in PATH", binary),
                "Install rclone: https://rclone.org/install/",
            ),
        }
    }

    fn check_source_dir(config: &Config) -> CheckResult {
        let source = config.source_path();
        if source.is_dir() {
            CheckResult::ok_with_details("Source directory exists", source.display().to_string())
        } else {
            CheckResult::error_with_details("Source directory does not exist", source.display().to_string())
        }
    }

    fn check_cache_dir(config: &Config) -> CheckResult {
        let cache = config.cache_path();
        if let Err(e) = std::fs::create_dir_all(&cache) {
            return CheckResult::error_with_details("Cannot create cache directory", format!("{}: {}", cache.display(), e));
        }
        match tempfile::NamedTempFile::new_in(&cache) {
            Ok(_) => CheckResult::ok_with_details("Cache directory writable", cache.display().to_string()),
            Err(e) => {
                CheckResult::error_with_details("Cache directory not writable", format!("{}: {}", cache.display(), e))
            }
        }
    }

    fn check_tags(config: &Config) -> CheckResult {
        let cache = config.cache_path();
        if !cache.is_dir() {
            return CheckResult::error("Tag storage untested, cache directory missing");
        }
        let state = match StateStore::open(config.state_path()) {
            Ok(state) => state,
            Err(e) => return CheckResult::error_with_details("State directory unavailable", format!("{:#}", e)),
        };
        match TagStore::open(config.tags.backend, &cache, &state) {
            Ok(store) if store.backend_name() == "sidecar" && config.tags.backend == TagBackendKind::Auto => {
                CheckResult::warning_with_details(
                    "Extended attributes unavailable, using sidecar tags",
                    state.tag_sidecar_path().display().to_string(),
                )
            }
            Ok(store) => CheckResult::ok_with_details("Tag storage available", store.backend_name()),
            Err(e) => CheckResult::error_with_details("Tag storage unavailable", format!("{:#}", e)),
        }
    }

    fn check_listing(config: &Config) -> CheckResult {
        match config.listing.command.first() {
            Some(program) if Path::new(program).is_absolute() && !Path::new(program).exists() => {
                CheckResult::error_with_details("Listing command not found", program.clone())
            }
            Some(_) => CheckResult::ok_with_details("Listing command configured", config.listing.command.join(" ")),
            None => CheckResult::warning_with_details(
                "No listing command configured",
                "reconcile needs --listing FILE",
            ),
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 5] {
        [
            ("Sync Tool", &self.tool),
            ("Source Directory", &self.source_dir),
            ("Cache Directory", &self.cache_dir),
            ("Tag Storage", &self.tags),
            ("Remote Listing", &self.listing),
        ]
    }
}
