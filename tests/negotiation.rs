//! Integration tests for version negotiation and legacy client support.

use serde_json::{json, Value};

use toolhub_mcp::config::Config;
use toolhub_mcp::mcp::messages::ClientHandshake;
use toolhub_mcp::mcp::{CompatibilityAdapter, ProtocolServer, ServerServices, VersionNegotiator};

fn modern(version: &str, caps: &[&str]) -> Value {
    json!({
        "mcp_version": version,
        "transport": "stdio",
        "capabilities": caps,
        "client_id": "integration",
    })
}

fn server() -> ProtocolServer {
    ProtocolServer::new(&Config::default(), ServerServices::default())
}

// =============================================================================
// Negotiator
// =============================================================================

#[test]
fn test_exact_version_is_agreed() {
    let result = VersionNegotiator::default().negotiate_value(&modern("2025-11", &["async"]));
    assert!(result.success);
    assert_eq!(result.agreed_version, "2025-11");
    assert_eq!(result.agreed_capabilities, vec!["async"]);
    assert!(result.error.is_none());
}

#[test]
fn test_supported_older_version_is_kept() {
    let result = VersionNegotiator::default().negotiate_value(&modern("2024-11", &[]));
    assert!(result.success);
    assert_eq!(result.agreed_version, "2024-11");
}

#[test]
fn test_nearby_version_is_pinned_to_server_version() {
    let result = VersionNegotiator::default().negotiate_value(&modern("2025-08", &[]));
    assert!(result.success);
    assert_eq!(result.agreed_version, "2025-11");
}

#[test]
fn test_distant_version_fails() {
    let result = VersionNegotiator::default().negotiate_value(&modern("2023-01", &["async"]));
    assert!(!result.success);
    assert!(result.agreed_capabilities.is_empty());
    assert!(result.error.unwrap().contains("2023-01"));
}

#[test]
fn test_garbage_version_fails() {
    let result = VersionNegotiator::default().negotiate_value(&modern("latest", &[]));
    assert!(!result.success);
    assert!(result.error.unwrap().contains("YYYY-MM"));
}

#[test]
fn test_malformed_handshake_fails() {
    let result = VersionNegotiator::default().negotiate_value(&json!({"mcp_version": "2025-11"}));
    assert!(!result.success);
    assert!(result.error.unwrap().starts_with("Malformed handshake"));
}

#[test]
fn test_capabilities_are_intersected_in_client_order() {
    let result = VersionNegotiator::default()
        .negotiate_value(&modern("2025-11", &["stream", "telepathy", "async", "stream"]));
    assert_eq!(result.agreed_capabilities, vec!["stream", "async"]);
}

#[test]
fn test_removed_capability_is_not_agreed() {
    let mut negotiator = VersionNegotiator::default();
    assert!(negotiator.remove_capability("async"));
    let result = negotiator.negotiate_value(&modern("2025-11", &["async", "registry"]));
    assert_eq!(result.agreed_capabilities, vec!["registry"]);
}

// =============================================================================
// Sessions
// =============================================================================

#[test]
fn test_session_records_negotiated_values() {
    let server = server();
    let reply = server
        .handshake_value("s1", &modern("2025-06", &["async", "unknown"]))
        .unwrap();
    assert_eq!(reply["mcp_version"], "2025-06");
    assert_eq!(reply["capabilities"], json!(["async"]));

    let session = server.session("s1").unwrap();
    assert_eq!(session.agreed_version, "2025-06");
    assert!(session.has_capability("async"));
    assert!(!session.is_legacy);
}

#[test]
fn test_second_handshake_is_rejected() {
    let server = server();
    server.handshake_value("s1", &modern("2025-11", &[])).unwrap();
    let err = server
        .handshake_value("s1", &modern("2025-11", &["async"]))
        .unwrap_err();
    assert!(!err.success);
    assert!(!server.session("s1").unwrap().has_capability("async"));
}

#[test]
fn test_failed_handshake_leaves_no_session() {
    let server = server();
    assert!(server.handshake_value("s1", &modern("1999-01", &[])).is_err());
    assert!(server.session("s1").is_none());
    server.handshake_value("s1", &modern("2025-11", &[])).unwrap();
    assert!(server.session("s1").is_some());
}

#[test]
fn test_legacy_handshake_gets_legacy_shaped_reply() {
    let server = server();
    let reply = server
        .handshake_value("old", &json!({"version": "1.0", "client_id": "legacy-client"}))
        .unwrap();

    assert_eq!(reply["version"], "2025-11");
    assert_eq!(reply["mcp_version"], "2025-11");

    let session = server.session("old").unwrap();
    assert!(session.is_legacy);
    assert_eq!(session.client_id.as_deref(), Some("legacy-client"));
}

#[test]
fn test_classification_of_raw_handshakes() {
    assert!(matches!(
        CompatibilityAdapter::classify_handshake(&modern("2025-11", &[])),
        ClientHandshake::Modern(_)
    ));
    assert!(matches!(
        CompatibilityAdapter::classify_handshake(&json!({})),
        ClientHandshake::Legacy(_)
    ));
    assert!(matches!(
        CompatibilityAdapter::classify_handshake(&json!({"mcp_version": "2025-11", "transport": "pigeon", "capabilities": []})),
        ClientHandshake::Malformed(_)
    ));
}
