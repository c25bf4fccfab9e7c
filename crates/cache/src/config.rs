//! Cache configuration
//!
//! The byte budget can come from a JSON file, environment variables, or be
//! built programmatically. The budget is policy only; the cache enforces it
//! but callers decide when a running cache picks up a new value via
//! [`FrameCache::set_byte_budget`](crate::FrameCache::set_byte_budget).

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MB: usize = 1024 * 1024;

/// User-configurable cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget for cached frame buffers.
    pub byte_budget: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            byte_budget: 250 * MB,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with a budget given in megabytes.
    pub fn new(budget_mb: usize) -> Self {
        Self {
            byte_budget: budget_mb * MB,
        }
    }

    /// Sets the byte budget in megabytes.
    pub fn with_budget_mb(mut self, mb: usize) -> Self {
        self.byte_budget = mb * MB;
        self
    }

    /// Returns the byte budget in megabytes.
    pub fn budget_mb(&self) -> usize {
        self.byte_budget / MB
    }

    /// Loads configuration from environment variables.
    ///
    /// - `FRAMEVIEW_CACHE_MB`: byte budget in MB (default: 250)
    ///
    /// # Errors
    /// Returns an error if a variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("FRAMEVIEW_CACHE_MB") {
            config.byte_budget = val
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue("FRAMEVIEW_CACHE_MB".to_string()))?
                * MB;
        }

        Ok(config)
    }

    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Saves configuration to a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        Ok(fs::write(path.as_ref(), json)?)
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing a configuration file
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Malformed configuration file
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
