//! Everything a cycle needs, loaded once when the cycle starts

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::checkers::CheckerRegistry;
use crate::config::{Config, ExportedTag};
use crate::rules::{PathRules, RuleCompiler};
use crate::state::StateStore;
use crate::tags::TagStore;

/// Per-file exclusion settings resolved from the configuration
#[derive(Debug, Clone, Default)]
pub struct ExclusionPolicy {
    pub browser_path: Option<PathBuf>,
    pub browser_enabled: bool,
    pub exported_tag: Option<ExportedTag>,
    pub max_file_size: Option<u64>,
    pub archive_extensions: Vec<String>,
    pub partial_extensions: Vec<String>,
}

impl ExclusionPolicy {
    pub fn from_config(config: &Config) -> Self {
        let lower = |extensions: &[String]| -> Vec<String> {
            extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect()
        };

        Self {
            browser_path: config.filters.browser.path.as_ref().map(PathBuf::from),
            browser_enabled: config.filters.browser.enabled,
            exported_tag: config.filters.exported_tag.clone(),
            max_file_size: config.max_file_size_bytes(),
            archive_extensions: lower(&config.filters.archive_extensions),
            partial_extensions: lower(&config.filters.partial_extensions),
        }
    }

    pub fn is_archive(&self, extension: Option<&str>) -> bool {
        extension.is_some_and(|ext| self.archive_extensions.iter().any(|known| known == ext))
    }

    pub fn is_partial(&self, extension: Option<&str>) -> bool {
        extension.is_some_and(|ext| self.partial_extensions.iter().any(|known| known == ext))
    }

    pub fn excludes_browser(&self, relative: &Path) -> bool {
        match &self.browser_path {
            Some(browser) => !self.browser_enabled && relative.starts_with(browser),
            None => false,
        }
    }
}

/// Configuration, compiled rules, checkers and tag storage for one cycle
pub struct CycleContext {
    pub config: Config,
    pub rules: PathRules,
    pub checkers: CheckerRegistry,
    pub tags: TagStore,
    pub state: StateStore,
    pub policy: ExclusionPolicy,
    pub expected_paths: Option<u64>,
}

impl CycleContext {
    pub fn load(config: Config) -> Result<Self> {
        config.validate()?;

        let source = config.source_path();
        let cache = config.cache_path();

        let state = StateStore::open(config.state_path())?;
        let rules = RuleCompiler::new(&source)
            .compile(&config.includes, &config.excludes, config.include_all_by_default)
            .context("Failed to compile path rules")?;
        let checkers = CheckerRegistry::from_config(&config.checkers, &source);
        let tags = TagStore::open(config.tags.backend, &cache, &state)?;
        let policy = ExclusionPolicy::from_config(&config);
        let expected_paths = state.expected_path_count(&source);

        info!(
            "Cycle context: {} rules, {} checkers, {} tags",
            rules.len(),
            checkers.len(),
            tags.backend_name()
        );
        debug!("Expected paths for {}: {:?}", source.display(), expected_paths);

        Ok(Self {
            config,
            rules,
            checkers,
            tags,
            state,
            policy,
            expected_paths,
        })
    }

    pub fn source_root(&self) -> PathBuf {
        self.config.source_path()
    }

    pub fn cache_root(&self) -> PathBuf {
        self.config.cache_path()
    }
}
