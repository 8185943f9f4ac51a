//! Configuration file handling.

use serde::{Deserialize, Serialize};
use std::path::Path;

use tracing::warn;

use crate::{parse_level, ConfigError, ConfigResult, EngineOptions};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable that overrides the configured log level.
pub const LOG_LEVEL_ENV: &str = "DUPLEX_LOG_LEVEL";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines instead of compact text.
    #[serde(default)]
    pub log_json: bool,
    /// Options applied to every engine built from this config.
    #[serde(default)]
    pub engine: EngineOptions,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            engine: EngineOptions::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from `path` if it exists, falling back to defaults.
    /// The environment still wins over the file for the log level.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.load_from_env();
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the log level name and the engine options.
    pub fn validate(&self) -> ConfigResult<()> {
        if parse_level(&self.log_level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level: {}",
                self.log_level
            )));
        }
        self.engine.validate()
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var(LOG_LEVEL_ENV) {
            let log_level = log_level.trim();
            if log_level.is_empty() {
                return;
            }
            if parse_level(log_level).is_some() {
                self.log_level = log_level.to_string();
            } else {
                warn!(value = log_level, "Ignoring unknown {}", LOG_LEVEL_ENV);
            }
        }
    }
}
