//! Configuration file loading and parsing.
//!
//! This module handles loading the configuration file from disk and parsing
//! it into validated, type-safe structures.
//!
//! # Configuration File Locations
//!
//! The configuration file is searched in the following order:
//!
//! 1. Path given as the positional `CONFIG_FILE` argument
//! 2. Default location:
//!    - **Linux/macOS:** `~/.toolhub-mcp/config.json`
//!    - **Windows:** `%USERPROFILE%\.toolhub-mcp\config.json`
//!
//! Every section is optional; an empty object yields a working stdio server
//! that only exposes the resident core tools.

mod settings;

pub use settings::{
    Config, JobsConfig, LoggingConfig, RegistryConfig, ServerConfig, ToolsConfig, ValidationConfig,
};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.toolhub-mcp/`
/// - **Windows:** `%USERPROFILE%\.toolhub-mcp\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".toolhub-mcp"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads and parses the configuration file.
///
/// If `path` is `None`, uses the platform-specific default location.
/// See [`load_config_or_default`] for the lenient variant used at startup.
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file cannot be found
/// - The file cannot be read
/// - The JSON is malformed
/// - Required fields are missing or invalid
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path().ok_or_else(|| ConfigError::NotFound {
            path: PathBuf::from("<default config path>"),
        })?,
    };

    if !config_path.exists() {
        return Err(ConfigError::NotFound { path: config_path });
    }

    let contents = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.clone(),
        source: e,
    })?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: config_path.clone(),
        source: e,
    })?;

    // Validate the configuration
    config.validate()?;

    Ok(config)
}

/// Loads the configuration, falling back to defaults when no path was given
/// and the default file does not exist.
///
/// # Errors
///
/// Returns an error if an explicit path is missing, or if any existing file
/// cannot be read, parsed or validated.
pub fn load_config_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
    match load_config(path) {
        Err(ConfigError::NotFound { path: missing }) if path.is_none() => {
            tracing::debug!(path = %missing.display(), "No configuration file, using defaults");
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
        other => other,
    }
}
