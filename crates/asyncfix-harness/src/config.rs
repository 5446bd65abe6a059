//! Harness configuration (asyncfix.toml)
//!
//! All fields are optional; an empty file yields the defaults.

use asyncfix_classfile::Scanner;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Harness settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Where the debug driver writes `.class` artifacts
    #[serde(default = "default_debug_dir")]
    pub debug_dir: PathBuf,

    /// Where traces are written (defaults to `debug_dir`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_dir: Option<PathBuf>,

    /// Roots searched when resolving a module by logical name
    #[serde(default)]
    pub class_path: Vec<PathBuf>,

    /// Internal name of the marker type the transformer should eliminate
    #[serde(default = "default_marker")]
    pub marker: String,

    /// Internal name used as the owner of synthesized fixtures
    #[serde(default = "default_owner")]
    pub owner: String,
}

fn default_debug_dir() -> PathBuf {
    PathBuf::from("target/classes2")
}

fn default_marker() -> String {
    "com/ea/async/Async".to_string()
}

fn default_owner() -> String {
    "asyncfix/Fixtures".to_string()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            debug_dir: default_debug_dir(),
            trace_dir: None,
            class_path: Vec::new(),
            marker: default_marker(),
            owner: default_owner(),
        }
    }
}

impl HarnessConfig {
    /// Load from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse from a string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field contents
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_internal_name("marker", &self.marker)?;
        validate_internal_name("owner", &self.owner)?;
        if self.debug_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "debug_dir cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory traces are written to
    pub fn trace_dir(&self) -> &Path {
        self.trace_dir.as_deref().unwrap_or(&self.debug_dir)
    }

    /// Scanner for the configured marker
    pub fn scanner(&self) -> Scanner {
        Scanner::new(self.marker.as_str())
    }
}

/// Internal names use `/` separators and have no empty segments
fn validate_internal_name(field: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{field} cannot be empty"
        )));
    }
    if name.contains('.') || name.split('/').any(str::is_empty) {
        return Err(ConfigError::ValidationError(format!(
            "Invalid {field}: {name}. Must be an internal name such as com/example/Type"
        )));
    }
    Ok(())
}
