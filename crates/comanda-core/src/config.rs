//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/comanda/config.toml)
//! 3. Environment variables (COMANDA_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
const ENV_PREFIX: &str = "COMANDA";

/// Default namespace for cached collection blobs
pub const DEFAULT_CACHE_PREFIX: &str = "comanda_";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (collection cache)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Remote document store URL (optional)
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Whether remote mirroring is enabled
    #[serde(default)]
    pub remote_enabled: bool,

    /// Prefix for the key each collection is cached under
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,

    /// Log file for the CLI (stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_url: None,
            remote_enabled: false,
            cache_prefix: default_cache_prefix(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (COMANDA_DATA_DIR, COMANDA_REMOTE_URL, ...)
    /// 2. Config file (~/.config/comanda/config.toml or COMANDA_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit path given on the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // Empty string clears the URL
        if let Ok(val) = std::env::var(format!("{}_REMOTE_URL", ENV_PREFIX)) {
            self.remote_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_REMOTE_ENABLED", ENV_PREFIX)) {
            self.remote_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Ok(val) = std::env::var(format!("{}_CACHE_PREFIX", ENV_PREFIX)) {
            if !val.is_empty() {
                self.cache_prefix = val;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_LOG_FILE", ENV_PREFIX)) {
            self.log_file = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with COMANDA_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("comanda")
            .join("config.toml")
    }

    /// Directory holding one blob per cached collection
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// The remote URL, if mirroring is both enabled and configured
    pub fn active_remote_url(&self) -> Option<&str> {
        if !self.remote_enabled {
            return None;
        }
        self.remote_url.as_deref().filter(|url| !url.is_empty())
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("comanda")
}

fn default_cache_prefix() -> String {
    DEFAULT_CACHE_PREFIX.to_string()
}
