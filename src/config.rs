use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;
use crate::model::ResolutionStrategy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VcsConfig {
    pub repository: RepositoryConfig,
    pub merge: MergeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub default_branch: String,
    /// Snapshot file; the repository is memory-only when unset
    pub data_path: Option<PathBuf>,
    /// Author recorded on the root commit
    pub system_author: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Attempts after a lost compare-and-swap before giving up
    pub max_retries: u32,
    /// Strategy name applied to merges that bring none of their own
    pub default_strategy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            data_path: None,
            system_author: "system".to_string(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_strategy: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl VcsConfig {
    /// Load configuration from environment variables and config file
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = config::Config::builder();

        // Add default configuration
        config = config.add_source(config::Config::try_from(&VcsConfig::default())?);

        // Add config file if it exists
        config = config.add_source(config::File::with_name("schema-vcs").required(false));

        // Add environment variables with prefix "SCHEMA_VCS_", e.g.
        // SCHEMA_VCS_MERGE__MAX_RETRIES=5
        config = config.add_source(
            config::Environment::with_prefix("SCHEMA_VCS")
                .prefix_separator("_")
                .separator("__"),
        );

        let config = config.build()?;
        let vcs_config: VcsConfig = config.try_deserialize()?;

        // Reject a bad strategy name at startup rather than mid-merge.
        vcs_config.merge.default_strategy()?;

        Ok(vcs_config)
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.repository.data_path = Some(path.into());
        self
    }
}

impl MergeConfig {
    pub fn default_strategy(&self) -> Result<Option<ResolutionStrategy>> {
        self.default_strategy
            .as_deref()
            .map(str::parse)
            .transpose()
    }
}

/// Initialize `env_logger` with the configured level; `RUST_LOG` still wins.
/// Safe to call more than once.
pub fn init_logging(logging: &LoggingConfig) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(logging.level.as_str()),
    )
    .try_init();
}
