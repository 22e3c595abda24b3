//! Configuration management for buildhist

pub mod schema;

pub use schema::{Config, GeneralConfig, ProjectConfig, RetentionConfig, StatusConfig};

use crate::error::{BuildhistError, BuildhistResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("buildhist")
            .join("config.toml")
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub async fn load(&self) -> BuildhistResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> BuildhistResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| BuildhistError::io(format!("reading config from {}", path.display()), e))?;

        let config: Config = toml::from_str(&content).map_err(|e| BuildhistError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::validate(path, &config)?;
        Ok(config)
    }

    fn validate(path: &Path, config: &Config) -> BuildhistResult<()> {
        let reason = if config.status.io_workers == 0 {
            "status.io_workers must be at least 1"
        } else if !matches!(config.general.log_format.as_str(), "text" | "json") {
            "general.log_format must be \"text\" or \"json\""
        } else {
            return Ok(());
        };
        Err(BuildhistError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> BuildhistResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            BuildhistError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> BuildhistResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BuildhistError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
