//! Error types for toolhub-mcp.
//!
//! Each component owns one error enum. Protocol-facing code converts these
//! into structured `{code, message, details}` payloads via [`ErrorPayload`];
//! nothing here is ever allowed to take the server down.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// A single field-level schema violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// JSON pointer to the offending value (`(root)` for the document itself).
    pub path: String,
    /// Human-readable description.
    pub message: String,
}

/// Errors raised while compiling or checking JSON schemas.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// The schema itself could not be compiled.
    #[error("invalid schema: {0}")]
    Compile(String),

    /// The schema is missing mandatory top-level metadata.
    #[error("schema is missing required metadata: {0}")]
    MissingMetadata(String),
}

/// Errors raised while discovering, loading or executing tools.
#[derive(Error, Debug)]
pub enum ToolError {
    /// No tool with this name is known.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// The tool manifest could not be read or parsed.
    #[error("failed to load tool '{name}': {reason}")]
    Load {
        /// Tool name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// The manifest does not name exactly one registered handler.
    #[error("tool '{name}' does not resolve to a registered handler")]
    NoHandler {
        /// Tool name.
        name: String,
    },

    /// The arguments did not satisfy the tool's input schema.
    #[error("invalid arguments for tool '{name}'")]
    InvalidArguments {
        /// Tool name.
        name: String,
        /// Field-level violations.
        errors: Vec<FieldError>,
    },

    /// The handler failed.
    #[error("{message}")]
    Execution {
        /// Error message returned by the handler.
        message: String,
        /// Optional diagnostic payload.
        details: Option<Value>,
    },
}

impl ToolError {
    /// Builds an execution error without diagnostic details.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            details: None,
        }
    }

    /// Returns the stable protocol error code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "TOOL_NOT_FOUND",
            Self::Load { .. } | Self::NoHandler { .. } => "TOOL_LOAD_FAILED",
            Self::InvalidArguments { .. } => "VALIDATION_FAILED",
            Self::Execution { .. } => "EXECUTION_FAILED",
        }
    }

    /// Returns diagnostic details for the error payload, if any.
    #[must_use]
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::InvalidArguments { errors, .. } => serde_json::to_value(errors).ok(),
            Self::Execution { details, .. } => details.clone(),
            Self::Load { reason, .. } => Some(serde_json::json!({ "reason": reason })),
            Self::NotFound(_) | Self::NoHandler { .. } => None,
        }
    }
}

/// Errors raised by the async job manager and its stores.
#[derive(Error, Debug)]
pub enum JobError {
    /// The job id is unknown.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// The live-job ceiling has been reached. Retryable.
    #[error("job capacity exceeded: {live} live jobs (max {max})")]
    CapacityExceeded {
        /// Jobs currently queued or running.
        live: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// The persistence layer failed.
    #[error("job store error: {0}")]
    Store(String),
}

impl JobError {
    /// Returns the stable protocol error code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "JOB_NOT_FOUND",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::Store(_) => "INTERNAL_ERROR",
        }
    }
}

/// Errors from the discovery registry HTTP client.
///
/// These never leave the client's public API; they are logged and swallowed.
#[derive(Error, Debug)]
pub enum RegistryClientError {
    /// The HTTP request failed.
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The registry answered with a non-success status.
    #[error("registry returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body (truncated by the caller if needed).
        body: String,
    },

    /// An operation that needs a registration was attempted before `register()`.
    #[error("server is not registered")]
    NotRegistered,
}

/// Structured error payload carried in tool-call responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable upper-snake error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional diagnostic payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    /// Creates a payload without details.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Adds diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: Option<Value>) -> Self {
        self.details = details;
        self
    }
}

impl From<&ToolError> for ErrorPayload {
    fn from(error: &ToolError) -> Self {
        Self::new(error.code(), error.to_string()).with_details(error.details())
    }
}

impl From<&JobError> for ErrorPayload {
    fn from(error: &JobError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}
