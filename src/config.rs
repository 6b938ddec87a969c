//! Configuration for the in-memory head
//!
//! Settings are read from TOML, then optionally overridden from environment
//! variables. Every field has a default, so an empty document is valid:
//!
//! ```toml
//! samples_per_chunk = 120
//! chunk_pool_capacity = 1024
//! max_regex_len = 4096
//! ```
//!
//! # Environment Overrides
//!
//! - `PROFSTORE_SAMPLES_PER_CHUNK`
//! - `PROFSTORE_CHUNK_POOL_CAPACITY`
//! - `PROFSTORE_MAX_REGEX_LEN`

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Head configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HeadConfig {
    /// Rows per chunk before a series cuts a new chunk set
    #[serde(default = "default_samples_per_chunk")]
    pub samples_per_chunk: u16,

    /// Maximum idle chunks kept per encoding by the chunk pool
    #[serde(default = "default_chunk_pool_capacity")]
    pub chunk_pool_capacity: usize,

    /// Longest regex a matcher accepts
    #[serde(default = "default_max_regex_len")]
    pub max_regex_len: usize,
}

// Default value functions
fn default_samples_per_chunk() -> u16 { 120 }
fn default_chunk_pool_capacity() -> usize { 1024 }
fn default_max_regex_len() -> usize { 4096 }

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            samples_per_chunk: default_samples_per_chunk(),
            chunk_pool_capacity: default_chunk_pool_capacity(),
            max_regex_len: default_max_regex_len(),
        }
    }
}

impl HeadConfig {
    /// Parse configuration from a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment variable overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// A variable that is set but does not parse is an error rather than
    /// being silently ignored.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_override("PROFSTORE_SAMPLES_PER_CHUNK")? {
            self.samples_per_chunk = v;
        }
        if let Some(v) = env_override("PROFSTORE_CHUNK_POOL_CAPACITY")? {
            self.chunk_pool_capacity = v;
        }
        if let Some(v) = env_override("PROFSTORE_MAX_REGEX_LEN")? {
            self.max_regex_len = v;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.samples_per_chunk == 0 {
            return Err(Error::Configuration(
                "samples_per_chunk must be > 0".to_string(),
            ));
        }
        if self.max_regex_len == 0 {
            return Err(Error::Configuration(
                "max_regex_len must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to a TOML document
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))
    }
}

fn env_override<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Configuration(format!("Invalid {}={:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}
