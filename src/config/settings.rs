//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::mcp::messages::Transport;
use crate::mcp::negotiation::{
    parse_version, DEFAULT_SERVER_CAPABILITIES, SUPPORTED_LEGACY_VERSIONS,
};
use crate::mcp::protocol::SERVER_NAME;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Server identity and advertised protocol features.
    #[serde(default)]
    pub server: ServerConfig,

    /// Tool discovery settings.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Async job settings.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Schema validation settings.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Discovery registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(invalid("server.capabilities must not contain empty names"));
        }

        for version in &self.server.supported_versions {
            if parse_version(version).is_none() {
                return Err(invalid(format!(
                    "Invalid protocol version '{version}'. Expected YYYY-MM"
                )));
            }
        }

        if self.jobs.max_jobs == 0 {
            return Err(invalid("jobs.max_jobs must be at least 1"));
        }
        if self.jobs.sweep_interval_secs == 0 {
            return Err(invalid("jobs.sweep_interval_secs must be at least 1"));
        }

        if self.registry.enabled {
            if self.registry.url.as_deref().map_or(true, str::is_empty) {
                return Err(invalid("registry.url is required when the registry is enabled"));
            }
            if self.registry.health_interval_secs == 0 {
                return Err(invalid("registry.health_interval_secs must be at least 1"));
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        message: message.into(),
    }
}

/// Server identity and negotiation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Identifier reported in handshakes and to the registry.
    #[serde(default = "default_server_id")]
    pub server_id: String,

    /// Transport this process serves.
    #[serde(default)]
    pub transport: Transport,

    /// Capabilities advertised to clients.
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,

    /// Older protocol versions accepted verbatim.
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            transport: Transport::default(),
            capabilities: default_capabilities(),
            supported_versions: default_supported_versions(),
        }
    }
}

fn default_server_id() -> String {
    SERVER_NAME.to_string()
}

fn default_capabilities() -> Vec<String> {
    DEFAULT_SERVER_CAPABILITIES
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_supported_versions() -> Vec<String> {
    SUPPORTED_LEGACY_VERSIONS
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// Tool discovery settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    /// Directory scanned for `*.json` tool manifests. Only resident core
    /// tools are available when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Async job settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobsConfig {
    /// Maximum number of queued or running jobs.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    /// Age after which a non-running job is removed.
    #[serde(default = "default_job_ttl")]
    pub ttl_secs: u64,

    /// Interval of the background TTL sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Poll hint returned to clients while a job is in flight.
    #[serde(default = "default_poll_after")]
    pub poll_after_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            ttl_secs: default_job_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            poll_after_secs: default_poll_after(),
        }
    }
}

const fn default_max_jobs() -> usize {
    100
}

const fn default_job_ttl() -> u64 {
    3600
}

const fn default_sweep_interval() -> u64 {
    300
}

const fn default_poll_after() -> u64 {
    2
}

/// Schema validation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Validate tool arguments before execution.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lifetime of a compiled validator.
    #[serde(default = "default_schema_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_secs: default_schema_ttl(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_schema_ttl() -> u64 {
    3600
}

/// Discovery registry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Register with the discovery registry on startup.
    #[serde(default)]
    pub enabled: bool,

    /// Registry base URL.
    #[serde(default)]
    pub url: Option<String>,

    /// Endpoint advertised to other clients (how to reach this server).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Interval of the health-report loop.
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Per-request timeout.
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            endpoint: None,
            health_interval_secs: default_health_interval(),
            timeout_secs: default_registry_timeout(),
        }
    }
}

const fn default_health_interval() -> u64 {
    60
}

const fn default_registry_timeout() -> u64 {
    10
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r"{}";
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.server_id, SERVER_NAME);
        assert_eq!(config.server.transport, Transport::Stdio);
        assert!(config.validation.enabled);
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "_comment": "Test config",
            "server": {
                "server_id": "toolhub-test",
                "transport": "http",
                "capabilities": ["async", "registry"],
                "supported_versions": ["2025-06"]
            },
            "tools": { "directory": "/opt/tools" },
            "jobs": {
                "max_jobs": 8,
                "ttl_secs": 60,
                "sweep_interval_secs": 10,
                "poll_after_secs": 1
            },
            "validation": { "enabled": false, "cache_ttl_secs": 30 },
            "registry": {
                "enabled": true,
                "url": "http://localhost:9000",
                "endpoint": "stdio://toolhub",
                "health_interval_secs": 15,
                "timeout_secs": 3
            },
            "logging": { "level": "debug" }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.server_id, "toolhub-test");
        assert_eq!(config.server.transport, Transport::Http);
        assert_eq!(config.server.capabilities, vec!["async", "registry"]);
        assert_eq!(config.tools.directory, Some(PathBuf::from("/opt/tools")));
        assert_eq!(config.jobs.max_jobs, 8);
        assert!(!config.validation.enabled);
        assert_eq!(config.registry.health_interval_secs, 15);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn jobs_config_defaults() {
        let config = JobsConfig::default();
        assert_eq!(config.max_jobs, 100);
        assert_eq!(config.ttl_secs, 3600);
        assert_eq!(config.poll_after_secs, 2);
    }

    #[test]
    fn server_defaults_advertise_async() {
        let config = ServerConfig::default();
        assert!(config.capabilities.iter().any(|c| c == "async"));
        assert!(!config.supported_versions.is_empty());
    }

    #[test]
    fn reject_zero_capacity() {
        let json = r#"{ "jobs": { "max_jobs": 0 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_enabled_registry_without_url() {
        let json = r#"{ "registry": { "enabled": true } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_malformed_supported_version() {
        let json = r#"{ "server": { "supported_versions": ["june"] } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_unknown_fields() {
        let json = r#"{
            "unknown_field": "value"
        }"#;

        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
