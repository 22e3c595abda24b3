//! Configuration schema for buildhist
//!
//! Configuration is stored at `~/.config/buildhist/config.toml`

use crate::cache::key::CodebaseConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Builder status and record cache settings
    pub status: StatusConfig,

    /// Retention horizons
    pub retention: RetentionConfig,

    /// Projects and their codebases, by project name
    pub projects: BTreeMap<String, ProjectConfig>,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Builder status settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Finished builds kept in memory per builder
    pub build_cache_size: usize,

    /// How far back finished-build queries scan
    pub max_search: usize,

    /// Latest-build memo entries older than this are rescanned
    pub last_build_cache_days: u32,

    /// Concurrent disk operations per builder
    pub io_workers: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            build_cache_size: 15,
            max_search: 2000,
            last_build_cache_days: 1,
            io_workers: 4,
        }
    }
}

/// Retention horizons; unset means keep everything
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Events kept in memory
    pub event_horizon: Option<usize>,

    /// Build records kept on disk
    pub build_horizon: Option<u64>,

    /// Build logs kept on disk
    pub log_horizon: Option<u64>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            event_horizon: Some(50),
            build_horizon: None,
            log_horizon: None,
        }
    }
}

/// A project's codebases
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub codebases: Vec<CodebaseConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[status]"));
        assert!(toml.contains("build_cache_size = 15"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.status.max_search, 2000);
        assert_eq!(config.retention.event_horizon, Some(50));
        assert!(config.retention.build_horizon.is_none());
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [retention]
            build_horizon = 5
            log_horizon = 3

            [[projects.web.codebases]]
            name = "app"
            default_branch = "main"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.retention.build_horizon, Some(5));
        assert_eq!(config.retention.event_horizon, Some(50)); // default preserved
        assert_eq!(config.projects["web"].codebases[0].configured_branch(), "main");
    }
}
