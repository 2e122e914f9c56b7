//! Tool-hub message shapes.
//!
//! Requests arrive as loosely shaped JSON. They are decoded exactly once, at
//! the boundary, into the tagged unions [`ClientHandshake`] and [`ToolCall`];
//! nothing past the boundary inspects raw JSON shape again.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorPayload;
use crate::jobs::JobHandle;

/// Wire transport of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Newline-delimited JSON over stdin/stdout.
    #[default]
    Stdio,
    /// HTTP.
    Http,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
            Self::Http => f.write_str("http"),
        }
    }
}

/// A version-negotiating client handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Requested protocol version (`YYYY-MM`).
    pub mcp_version: String,
    /// Client transport.
    pub transport: Transport,
    /// Capabilities the client can use.
    pub capabilities: Vec<String>,
    /// Client identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Free-form client metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Handshake {
    /// Decodes a modern handshake.
    ///
    /// # Errors
    ///
    /// Returns a description of the first structural problem: missing or
    /// non-string version, missing or unknown transport, or capabilities that
    /// are not a list of strings.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "handshake must be an object".to_string())?;

        let mcp_version = match obj.get("mcp_version") {
            Some(Value::String(v)) if !v.trim().is_empty() => v.clone(),
            Some(_) => return Err("mcp_version must be a non-empty string".to_string()),
            None => return Err("missing mcp_version".to_string()),
        };

        let transport = obj
            .get("transport")
            .ok_or_else(|| "missing transport".to_string())
            .and_then(|t| {
                Transport::deserialize(t).map_err(|_| format!("unsupported transport: {t}"))
            })?;

        let capabilities = match obj.get("capabilities") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|c| c.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| "capabilities must be strings".to_string())?,
            Some(_) => return Err("capabilities must be a list".to_string()),
            None => return Err("missing capabilities".to_string()),
        };

        Ok(Self {
            mcp_version,
            transport,
            capabilities,
            client_id: obj.get("client_id").and_then(Value::as_str).map(str::to_string),
            metadata: obj.get("metadata").cloned(),
        })
    }
}

/// A handshake from a client that predates version negotiation.
///
/// Every field is optional; decoding never fails.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyHandshake {
    /// Legacy `version` field, informational only.
    pub version: Option<String>,
    /// Client identity (`client_id`, `clientId` or `client`).
    pub client_id: Option<String>,
    /// Capabilities, if the client sent any strings.
    pub capabilities: Option<Vec<String>>,
    /// Transport, if present and recognised.
    pub transport: Option<Transport>,
    /// Free-form metadata.
    pub metadata: Option<Value>,
}

impl LegacyHandshake {
    /// Best-effort decoding of a legacy handshake.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let field = |names: &[&str]| names.iter().find_map(|n| value.get(*n));
        let text = |names: &[&str]| match field(names) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Self {
            version: text(&["version", "protocolVersion"]),
            client_id: text(&["client_id", "clientId", "client"]),
            capabilities: field(&["capabilities"])
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect()),
            transport: field(&["transport"]).and_then(|t| Transport::deserialize(t).ok()),
            metadata: field(&["metadata"]).cloned(),
        }
    }
}

/// A handshake after boundary classification.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientHandshake {
    /// Version-negotiating client.
    Modern(Handshake),
    /// Pre-negotiation client.
    Legacy(LegacyHandshake),
    /// Modern-shaped but structurally invalid.
    Malformed(String),
}

/// The server side of a handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHandshake {
    /// Negotiated protocol version.
    pub mcp_version: String,
    /// Server transport.
    pub transport: Transport,
    /// Negotiated capabilities.
    pub capabilities: Vec<String>,
    /// Server identity.
    pub server_id: String,
    /// Free-form server metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// An established session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Client identity, if sent.
    pub client_id: Option<String>,
    /// Negotiated protocol version.
    pub agreed_version: String,
    /// Negotiated capabilities.
    pub agreed_capabilities: Vec<String>,
    /// Whether the client speaks the legacy shapes.
    pub is_legacy: bool,
}

impl Session {
    /// Whether `capability` was agreed.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.agreed_capabilities.iter().any(|c| c == capability)
    }
}

/// Requested execution mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    /// Execute and answer with the result.
    #[default]
    Sync,
    /// Answer with a job handle.
    Async,
}

/// A modern tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Caller-chosen request id; generated when absent.
    #[serde(default = "generate_request_id")]
    pub request_id: String,
    /// Tool to execute. Required; checked by the server, not the decoder.
    #[serde(default)]
    pub tool_id: Option<String>,
    /// Tool arguments.
    #[serde(default = "empty_object")]
    pub arguments: Value,
    /// Execution mode.
    #[serde(default)]
    pub mode: CallMode,
}

/// A legacy tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyToolCall {
    /// Request id (`request_id` or `id`), generated when absent.
    pub request_id: String,
    /// Tool name (`tool`, `name`, `method` or `tool_id`).
    pub tool_name: Option<String>,
    /// Arguments (`arguments`, `params` or `args`).
    pub arguments: Value,
}

impl LegacyToolCall {
    /// Best-effort decoding of a legacy tool call.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let request_id = ["request_id", "id"]
            .iter()
            .find_map(|k| match value.get(*k) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(generate_request_id);

        let tool_name = ["tool", "name", "method", "tool_id"]
            .iter()
            .find_map(|k| value.get(*k).and_then(Value::as_str))
            .map(str::to_string);

        let arguments = ["arguments", "params", "args"]
            .iter()
            .find_map(|k| value.get(*k))
            .filter(|v| !v.is_null())
            .cloned()
            .unwrap_or_else(empty_object);

        Self {
            request_id,
            tool_name,
            arguments,
        }
    }
}

/// A tool call after boundary classification.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    /// Modern shape.
    Modern(ToolCallRequest),
    /// Legacy shape.
    Legacy(LegacyToolCall),
}

impl ToolCall {
    /// The request id either shape carries.
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::Modern(call) => &call.request_id,
            Self::Legacy(call) => &call.request_id,
        }
    }
}

/// Outcome of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Finished with a result.
    Success,
    /// Rejected or failed.
    Error,
    /// Running as a job.
    InProgress,
}

/// Execution metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Handler wall-clock time.
    pub duration_ms: u64,
}

/// Response to a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    /// Echoed request id.
    pub request_id: String,
    /// Outcome.
    pub status: ResponseStatus,
    /// Handler output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Structured error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// Execution metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
    /// Job id for async calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Seconds before the first poll, for async calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_after: Option<u64>,
    /// Progress at submission, for async calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl ToolCallResponse {
    /// A successful synchronous result.
    #[must_use]
    pub fn success(request_id: impl Into<String>, result: Value, duration_ms: u64) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Success,
            result: Some(result),
            error: None,
            metadata: Some(ResponseMetadata { duration_ms }),
            job_id: None,
            poll_after: None,
            progress: None,
        }
    }

    /// A rejected or failed call.
    #[must_use]
    pub fn failure(request_id: impl Into<String>, error: ErrorPayload) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(error),
            metadata: None,
            job_id: None,
            poll_after: None,
            progress: None,
        }
    }

    /// An accepted async call.
    #[must_use]
    pub fn in_progress(handle: JobHandle) -> Self {
        Self {
            request_id: handle.request_id,
            status: ResponseStatus::InProgress,
            result: None,
            error: None,
            metadata: None,
            job_id: Some(handle.job_id),
            poll_after: Some(handle.poll_after),
            progress: Some(0.0),
        }
    }
}

fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}
