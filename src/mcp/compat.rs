//! Support for clients that predate version negotiation.
//!
//! The adapter sits at the transport boundary. It classifies every incoming
//! handshake and tool call into a tagged variant, synthesises modern
//! handshakes for legacy clients, and re-shapes responses with legacy field
//! names when asked to. It never fails on shape alone.

use serde_json::Value;

use super::messages::{
    ClientHandshake, Handshake, LegacyHandshake, LegacyToolCall, ToolCall, ToolCallRequest,
    Transport,
};
use crate::error::ErrorPayload;

/// Translates between legacy and modern message shapes.
#[derive(Debug, Clone)]
pub struct CompatibilityAdapter {
    server_version: String,
}

impl CompatibilityAdapter {
    /// Creates an adapter that stamps `server_version` on converted messages.
    pub fn new(server_version: impl Into<String>) -> Self {
        Self {
            server_version: server_version.into(),
        }
    }

    /// Whether `request` lacks `mcp_version` or carries a legacy `version`.
    #[must_use]
    pub fn is_legacy_request(request: &Value) -> bool {
        request.get("mcp_version").is_none() || request.get("version").is_some()
    }

    /// Classifies a raw handshake.
    #[must_use]
    pub fn classify_handshake(request: &Value) -> ClientHandshake {
        if Self::is_legacy_request(request) {
            return ClientHandshake::Legacy(LegacyHandshake::from_value(request));
        }
        match Handshake::from_value(request) {
            Ok(handshake) => ClientHandshake::Modern(handshake),
            Err(reason) => ClientHandshake::Malformed(reason),
        }
    }

    /// Whether a tool call looks legacy: a tool name without `tool_id`.
    #[must_use]
    pub fn is_legacy_tool_call(request: &Value) -> bool {
        request.get("tool_id").is_none()
            && ["tool", "name", "method"]
                .iter()
                .any(|k| request.get(*k).is_some())
    }

    /// Classifies a raw tool call for a session.
    ///
    /// Legacy sessions always get the lenient legacy decoding.
    ///
    /// # Errors
    ///
    /// Returns an `INVALID_REQUEST` payload when a modern call cannot be decoded.
    pub fn classify_tool_call(request: &Value, legacy_session: bool) -> Result<ToolCall, ErrorPayload> {
        if legacy_session {
            return Ok(ToolCall::Legacy(LegacyToolCall::from_value(request)));
        }
        serde_json::from_value::<ToolCallRequest>(request.clone())
            .map(ToolCall::Modern)
            .map_err(|e| ErrorPayload::new("INVALID_REQUEST", format!("Invalid tool call: {e}")))
    }

    /// Synthesises a modern handshake for a legacy client.
    #[must_use]
    pub fn convert_to_modern(&self, legacy: LegacyHandshake, connection: Transport) -> Handshake {
        Handshake {
            mcp_version: self.server_version.clone(),
            transport: legacy.transport.unwrap_or(connection),
            capabilities: legacy.capabilities.unwrap_or_default(),
            client_id: legacy.client_id,
            metadata: legacy.metadata,
        }
    }

    /// Adds legacy field names to a response when `requested`.
    ///
    /// Modern fields stay in place, except that `error` becomes the message
    /// string and the structured error moves to `error_details`.
    #[must_use]
    pub fn convert_to_legacy(&self, response: Value, requested: bool) -> Value {
        if !requested {
            return response;
        }
        let Value::Object(mut obj) = response else {
            return response;
        };

        let version = obj
            .get("mcp_version")
            .cloned()
            .unwrap_or_else(|| Value::String(self.server_version.clone()));
        obj.entry("version").or_insert(version);

        if let Some(id) = obj.get("request_id").cloned() {
            obj.entry("id").or_insert(id);
        }

        if let Some(status) = obj.get("status").and_then(Value::as_str) {
            let success = status == "success";
            obj.insert("success".to_string(), Value::Bool(success));
        }

        if let Some(result) = obj.get("result").cloned() {
            obj.insert("data".to_string(), result);
        }

        if let Some(Value::Object(error)) = obj.remove("error") {
            let message = error
                .get("message")
                .cloned()
                .unwrap_or_else(|| Value::String("Unknown error".to_string()));
            obj.insert("error".to_string(), message);
            obj.insert("error_details".to_string(), Value::Object(error));
        }

        Value::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> CompatibilityAdapter {
        CompatibilityAdapter::new("2025-11")
    }

    #[test]
    fn detects_legacy_requests() {
        assert!(CompatibilityAdapter::is_legacy_request(&json!({"client": "x"})));
        assert!(CompatibilityAdapter::is_legacy_request(&json!({"mcp_version": "2025-11", "version": "1"})));
        assert!(!CompatibilityAdapter::is_legacy_request(&json!({"mcp_version": "2025-11"})));
    }

    #[test]
    fn classify_handshake_variants() {
        let modern = json!({"mcp_version": "2025-11", "transport": "stdio", "capabilities": []});
        assert!(matches!(
            CompatibilityAdapter::classify_handshake(&modern),
            ClientHandshake::Modern(_)
        ));

        let legacy = json!({"version": "1.0"});
        assert!(matches!(
            CompatibilityAdapter::classify_handshake(&legacy),
            ClientHandshake::Legacy(_)
        ));

        let broken = json!({"mcp_version": "2025-11", "capabilities": []});
        assert!(matches!(
            CompatibilityAdapter::classify_handshake(&broken),
            ClientHandshake::Malformed(_)
        ));
    }

    #[test]
    fn convert_to_modern_fills_defaults() {
        let legacy = LegacyHandshake {
            client_id: Some("old".to_string()),
            ..LegacyHandshake::default()
        };
        let hs = adapter().convert_to_modern(legacy, Transport::Http);
        assert_eq!(hs.mcp_version, "2025-11");
        assert_eq!(hs.transport, Transport::Http);
        assert!(hs.capabilities.is_empty());
        assert_eq!(hs.client_id.as_deref(), Some("old"));
    }

    #[test]
    fn convert_to_legacy_is_identity_unless_requested() {
        let response = json!({"request_id": "r", "status": "success", "result": 1});
        assert_eq!(adapter().convert_to_legacy(response.clone(), false), response);
    }

    #[test]
    fn convert_to_legacy_adds_aliases_and_keeps_modern_fields() {
        let converted = adapter().convert_to_legacy(
            json!({"request_id": "r", "status": "success", "result": {"v": 1}}),
            true,
        );
        assert_eq!(converted["id"], "r");
        assert_eq!(converted["success"], true);
        assert_eq!(converted["data"], json!({"v": 1}));
        assert_eq!(converted["result"], json!({"v": 1}));
        assert_eq!(converted["status"], "success");
        assert_eq!(converted["version"], "2025-11");

        let failed = adapter().convert_to_legacy(
            json!({"request_id": "r", "status": "error", "error": {"code": "TOOL_NOT_FOUND", "message": "Tool not found: x"}}),
            true,
        );
        assert_eq!(failed["success"], false);
        assert_eq!(failed["error"], "Tool not found: x");
        assert_eq!(failed["error_details"]["code"], "TOOL_NOT_FOUND");
    }

    #[test]
    fn classify_tool_call_by_session() {
        let raw = json!({"name": "echo", "args": {"a": 1}});
        assert!(CompatibilityAdapter::is_legacy_tool_call(&raw));
        let call = CompatibilityAdapter::classify_tool_call(&raw, true).unwrap();
        let ToolCall::Legacy(call) = call else {
            panic!("expected legacy call");
        };
        assert_eq!(call.tool_name.as_deref(), Some("echo"));

        let modern = json!({"request_id": "r", "tool_id": "echo", "mode": "async"});
        assert!(!CompatibilityAdapter::is_legacy_tool_call(&modern));
        assert!(matches!(
            CompatibilityAdapter::classify_tool_call(&modern, false).unwrap(),
            ToolCall::Modern(_)
        ));

        let bad = json!({"tool_id": "echo", "mode": "later"});
        let err = CompatibilityAdapter::classify_tool_call(&bad, false).unwrap_err();
        assert_eq!(err.code, "INVALID_REQUEST");
    }
}
