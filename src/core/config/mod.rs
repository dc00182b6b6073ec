//! core::config
//!
//! Configuration schema and loading.
//!
//! # Locations
//!
//! Searched in order, first hit wins:
//! 1. `$OPCOORD_CONFIG` if set
//! 2. `$XDG_CONFIG_HOME/opcoord/config.toml`
//! 3. `~/.opcoord/config.toml` (canonical write location)
//!
//! Missing files are not an error; defaults are used.
//!
//! # Example
//!
//! ```no_run
//! use opcoord::core::config::Config;
//!
//! let config = Config::load().unwrap();
//! println!("workers: {}", config.coordinator().max_concurrent);
//! if let Some(path) = config.loaded_from() {
//!     println!("loaded from {}", path.display());
//! }
//! ```

pub mod schema;

pub use schema::{CoordConfig, CoordinatorConfig, TransactionConfig};

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "OPCOORD_CONFIG";

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("failed to write config file '{path}': {source}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config value: {0}")]
    InvalidValue(String),

    #[error("home directory not found")]
    NoHomeDir,
}

/// Loaded configuration plus where it came from.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub file: CoordConfig,
    /// Path the configuration was read from, if any.
    path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read, parsed,
    /// or validated.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::locate() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load and validate one config file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let file: CoordConfig = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        file.validate()?;

        Ok(Self {
            file,
            path: Some(path.to_path_buf()),
        })
    }

    /// First existing config file in search order.
    fn locate() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        if let Ok(xdg_home) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_home).join("opcoord/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        dirs::home_dir()
            .map(|home| home.join(".opcoord/config.toml"))
            .filter(|path| path.exists())
    }

    /// Canonical path for the config file: `~/.opcoord/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".opcoord/config.toml"))
    }

    /// Write a config file atomically.
    ///
    /// Creates parent directories if needed, writes to a temp file in the
    /// same directory, fsyncs it, then renames over `path`.
    pub fn write_atomic(path: &Path, config: &CoordConfig) -> Result<(), ConfigError> {
        config.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let contents =
            toml::to_string_pretty(config).map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

        let temp_path = path.with_extension("toml.tmp");
        let mut file = fs::File::create(&temp_path).map_err(|e| ConfigError::WriteError {
            path: temp_path.clone(),
            source: e,
        })?;

        file.write_all(contents.as_bytes())
            .map_err(|e| ConfigError::WriteError {
                path: temp_path.clone(),
                source: e,
            })?;

        file.sync_all().map_err(|e| ConfigError::WriteError {
            path: temp_path.clone(),
            source: e,
        })?;

        fs::rename(&temp_path, path).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }

    pub fn coordinator(&self) -> &CoordinatorConfig {
        &self.file.coordinator
    }

    pub fn transactions(&self) -> &TransactionConfig {
        &self.file.transactions
    }

    /// Path the configuration was loaded from, if any.
    pub fn loaded_from(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
