use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::SyncError;
use crate::rules::RuleNode;

/// Main configuration structure for mirrorsync
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Live tree being protected
    pub source: String,

    /// Local full-precision mirror of the tracked subtree
    pub cache: String,

    /// Remote location handed to the sync tool (e.g. "remote:backup")
    pub dest: String,

    /// Whether the tree is included when no include rule is given
    #[serde(default = "default_true")]
    pub include_all_by_default: bool,

    /// Include tree
    #[serde(default)]
    pub includes: Vec<RuleNode>,

    /// Exclude tree
    #[serde(default)]
    pub excludes: Vec<RuleNode>,

    /// Per-file exclusion policy
    #[serde(default)]
    pub filters: FilterConfig,

    /// Volatility checkers keyed by relative path
    #[serde(default)]
    pub checkers: Vec<CheckerConfig>,

    /// External sync tool settings
    #[serde(default)]
    pub tool: ToolConfig,

    /// Remote listing settings
    #[serde(default)]
    pub listing: ListingConfig,

    /// Tag storage settings
    #[serde(default)]
    pub tags: TagConfig,

    /// Directory for the path-count estimate and the tag sidecar
    #[serde(default = "default_state_directory")]
    pub state_directory: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-file exclusion policy
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FilterConfig {
    /// Files above this size are skipped unless they are archives ("100MB", "1GB")
    pub max_file_size: Option<String>,

    /// Extensions exempt from the size ceiling
    #[serde(default = "default_archive_extensions")]
    pub archive_extensions: Vec<String>,

    /// Extensions of incomplete downloads
    #[serde(default = "default_partial_extensions")]
    pub partial_extensions: Vec<String>,

    /// Browser profile subtree toggle
    #[serde(default)]
    pub browser: BrowserConfig,

    /// Tag marking files already handled by another consumer
    pub exported_tag: Option<ExportedTag>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct BrowserConfig {
    /// Relative path of the browser configuration subtree
    pub path: Option<String>,

    /// Back up the subtree
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ExportedTag {
    pub name: String,
    pub value: String,
}

/// One registered volatility checker
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckerConfig {
    /// Bracket-sectioned text file with volatile sections or lines
    Sections {
        path: String,
        #[serde(default)]
        ignore_sections: Vec<String>,
        #[serde(default)]
        ignore_substrings: Vec<String>,
    },
    /// Content retrieved from an external query, hash kept in `hash_path`
    External {
        path: String,
        hash_path: String,
        command: Vec<String>,
    },
}

/// External sync tool settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ToolConfig {
    /// Binary name or path
    #[serde(default = "default_tool_binary")]
    pub binary: String,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_retries_sleep")]
    pub retries_sleep: String,

    /// Parallel checkers
    #[serde(default = "default_checkers")]
    pub checkers: usize,

    /// Parallel transfers
    #[serde(default = "default_transfers")]
    pub transfers: usize,
}

/// Remote listing settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ListingConfig {
    /// Command printing the remote listing report on stdout
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default = "default_date_open")]
    pub date_open: String,

    #[serde(default = "default_date_close")]
    pub date_close: String,

    /// chrono format of the truncated date (no year)
    #[serde(default = "default_date_format")]
    pub date_format: String,

    /// Remote dates are UTC rather than local time
    #[serde(default)]
    pub utc: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TagConfig {
    #[serde(default)]
    pub backend: TagBackendKind,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TagBackendKind {
    /// Extended attributes where the platform has them, sidecar otherwise
    #[default]
    Auto,
    Xattr,
    Sidecar,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_archive_extensions() -> Vec<String> {
    ["zip", "tar", "gz", "tgz", "xz", "zst", "7z", "bz2"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_partial_extensions() -> Vec<String> {
    ["part", "crdownload", "partial", "download"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_tool_binary() -> String {
    "rclone".to_string()
}
fn default_retries() -> u32 {
    5
}
fn default_retries_sleep() -> String {
    "10s".to_string()
}
fn default_checkers() -> usize {
    16
}
fn default_transfers() -> usize {
    4
}
fn default_date_open() -> String {
    "[".to_string()
}
fn default_date_close() -> String {
    "]".to_string()
}
fn default_date_format() -> String {
    "%b %d %H:%M".to_string()
}
fn default_state_directory() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/mirrorsync", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/mirrorsync", home)
    } else {
        "/tmp/mirrorsync".to_string()
    }
}
fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_file_size: Some("1GB".to_string()),
            archive_extensions: default_archive_extensions(),
            partial_extensions: default_partial_extensions(),
            browser: BrowserConfig::default(),
            exported_tag: None,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: default_tool_binary(),
            retries: default_retries(),
            retries_sleep: default_retries_sleep(),
            checkers: default_checkers(),
            transfers: default_transfers(),
        }
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            date_open: default_date_open(),
            date_close: default_date_close(),
            date_format: default_date_format(),
            utc: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            color: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("mirrorsync").join("config.yml"))
    }

    /// Expand environment variables and `~` in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.source = shellexpand::full(&self.source)
            .context("Failed to expand source path")?
            .into_owned();

        self.cache = shellexpand::full(&self.cache)
            .context("Failed to expand cache path")?
            .into_owned();

        self.dest = shellexpand::full(&self.dest)
            .context("Failed to expand dest path")?
            .into_owned();

        self.state_directory = shellexpand::full(&self.state_directory)
            .context("Failed to expand state_directory path")?
            .into_owned();

        Ok(())
    }

    /// Check the invariants a cycle relies on: the source exists, the cache can be created
    pub fn validate(&self) -> Result<()> {
        let source = self.source_path();
        if !source.is_dir() {
            return Err(SyncError::Config(format!(
                "source directory does not exist: {}",
                source.display()
            ))
            .into());
        }
        if !source.is_absolute() || !self.cache_path().is_absolute() {
            return Err(SyncError::Config("source and cache must be absolute paths".to_string()).into());
        }

        std::fs::create_dir_all(self.cache_path())
            .with_context(|| format!("Failed to create cache directory: {}", self.cache))?;

        Ok(())
    }

    pub fn source_path(&self) -> PathBuf {
        PathBuf::from(&self.source)
    }

    pub fn cache_path(&self) -> PathBuf {
        PathBuf::from(&self.cache)
    }

    pub fn dest_path(&self) -> PathBuf {
        PathBuf::from(&self.dest)
    }

    pub fn state_path(&self) -> PathBuf {
        PathBuf::from(&self.state_directory)
    }

    /// Convert the size ceiling string to bytes
    pub fn max_file_size_bytes(&self) -> Option<u64> {
        self.filters.max_file_size.as_deref().and_then(parse_size)
    }
}

/// Parse sizes such as "512", "64K", "100MB", "1GB" (binary multiples)
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        _ => return None,
    };

    value.checked_mul(multiplier)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: "${HOME}".to_string(),
            cache: "${HOME}/.cache/mirrorsync/mirror".to_string(),
            dest: "remote:backup".to_string(),
            include_all_by_default: default_true(),
            includes: Vec::new(),
            excludes: vec![RuleNode::Leaf(".cache".to_string())],
            filters: FilterConfig::default(),
            checkers: Vec::new(),
            tool: ToolConfig::default(),
            listing: ListingConfig::default(),
            tags: TagConfig::default(),
            state_directory: default_state_directory(),
            logging: LoggingConfig::default(),
        }
    }
}
