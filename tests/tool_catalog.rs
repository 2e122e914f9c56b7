//! Integration tests for the shipped tool manifests and progressive loading.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use toolhub_mcp::config::Config;
use toolhub_mcp::error::ToolError;
use toolhub_mcp::jobs::InMemoryJobStore;
use toolhub_mcp::mcp::{ProtocolServer, ServerServices};
use toolhub_mcp::memory::{ListOptions, MemoryEntry, MemoryStats, MemoryStore, QueryOptions, StoreOptions};
use toolhub_mcp::tools::{DetailLevel, HandlerTable, SearchQuery, ToolLoader};

fn tools_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tools")
}

fn loader() -> ToolLoader {
    ToolLoader::new(Some(tools_dir()), Arc::new(HandlerTable::with_builtins()))
}

/// Keeps entries in a vector; queries match keys by substring.
#[derive(Default)]
struct VecMemory {
    entries: Mutex<Vec<MemoryEntry>>,
}

#[async_trait]
impl MemoryStore for VecMemory {
    async fn store(&self, key: &str, value: Value, options: StoreOptions) -> Result<String, ToolError> {
        let mut entries = self.entries.lock();
        let id = format!("mem-{}", entries.len() + 1);
        entries.push(MemoryEntry {
            id: id.clone(),
            key: key.to_string(),
            value,
            namespace: options.namespace,
            tags: options.tags,
            score: None,
        });
        Ok(id)
    }

    async fn query(&self, text: &str, options: QueryOptions) -> Result<Vec<MemoryEntry>, ToolError> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|e| e.key.contains(text))
            .take(options.limit.unwrap_or(usize::MAX))
            .cloned()
            .map(|mut e| {
                e.score = Some(1.0);
                e
            })
            .collect())
    }

    async fn list(&self, options: ListOptions) -> Result<Vec<MemoryEntry>, ToolError> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .skip(options.offset.unwrap_or(0))
            .take(options.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn status(&self) -> Result<MemoryStats, ToolError> {
        Ok(MemoryStats {
            total_entries: self.entries.lock().len() as u64,
            ..MemoryStats::default()
        })
    }
}

fn server(memory: Option<Arc<dyn MemoryStore>>) -> ProtocolServer {
    let mut config = Config::default();
    config.tools.directory = Some(tools_dir());
    let server = ProtocolServer::new(
        &config,
        ServerServices {
            handlers: HandlerTable::with_builtins(),
            memory,
            job_store: Arc::new(InMemoryJobStore::new()),
        },
    );
    server
        .handshake_value(
            "s1",
            &json!({"mcp_version": "2025-11", "transport": "stdio", "capabilities": []}),
        )
        .unwrap();
    server
}

fn call(tool: &str, arguments: Value) -> Value {
    json!({"request_id": format!("call-{tool}"), "tool_id": tool, "arguments": arguments})
}

// =============================================================================
// Discovery
// =============================================================================

#[test]
fn test_shipped_manifests_are_discovered_without_loading() {
    let loader = loader();
    let index = loader.scan_tools();
    let names: Vec<&str> = index.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        vec!["memory_list", "memory_query", "memory_status", "memory_store"]
    );
    assert_eq!(loader.loaded_count(), 0);
    assert_eq!(loader.load_count(), 0);
}

#[test]
fn test_names_only_listing_omits_everything_else() {
    let listing = loader().describe_tools(&SearchQuery {
        detail_level: Some(DetailLevel::NamesOnly),
        ..SearchQuery::default()
    });
    assert_eq!(listing.len(), 4);
    for entry in &listing {
        let obj = entry.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj.get("description").is_none());
        assert!(obj.get("inputSchema").is_none());
    }
}

#[test]
fn test_tag_filters_are_conjunctive() {
    let loader = loader();
    let search = |tags: &[&str]| -> Vec<String> {
        loader
            .search_tools(&SearchQuery {
                tags: tags.iter().map(ToString::to_string).collect(),
                ..SearchQuery::default()
            })
            .into_iter()
            .map(|m| m.name)
            .collect()
    };

    assert_eq!(search(&["memory", "read"]), vec!["memory_list", "memory_query"]);
    assert_eq!(search(&["read", "search"]), vec!["memory_query"]);
    assert!(search(&["write", "search"]).is_empty());
}

#[test]
fn test_full_detail_respects_manifest_ceiling() {
    let loader = loader();
    let listing = loader.describe_tools(&SearchQuery {
        detail_level: Some(DetailLevel::Full),
        ..SearchQuery::default()
    });

    let status = listing.iter().find(|t| t["name"] == "memory_status").unwrap();
    assert!(status.get("inputSchema").is_none());

    let store = listing.iter().find(|t| t["name"] == "memory_store").unwrap();
    assert_eq!(store["inputSchema"]["required"], json!(["key", "value"]));
    assert!(store.get("outputSchema").is_some());
}

#[test]
fn test_loaded_tools_are_cached_until_reload() {
    let loader = loader();
    let first = loader.load_tool("memory_query").unwrap();
    let second = loader.load_tool("memory_query").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.load_count(), 1);

    loader.reload();
    let third = loader.load_tool("memory_query").unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(loader.load_count(), 2);
}

// =============================================================================
// Execution through the protocol server
// =============================================================================

#[tokio::test]
async fn test_memory_tools_round_trip_through_the_store() {
    let server = server(Some(Arc::new(VecMemory::default())));

    let stored = server
        .tool_call_value("s1", &call("memory_store", json!({"key": "greeting", "value": "hello", "tags": ["demo"]})))
        .await;
    assert_eq!(stored["status"], "success", "{stored}");
    assert_eq!(stored["result"], json!({"id": "mem-1", "key": "greeting"}));

    let found = server
        .tool_call_value("s1", &call("memory_query", json!({"query": "greet"})))
        .await;
    assert_eq!(found["result"]["count"], 1);
    assert_eq!(found["result"]["entries"][0]["value"], "hello");

    let status = server.tool_call_value("s1", &call("memory_status", json!({}))).await;
    assert_eq!(status["result"]["total_entries"], 1);
}

#[tokio::test]
async fn test_invalid_arguments_are_rejected_before_execution() {
    let memory = Arc::new(VecMemory::default());
    let server = server(Some(memory.clone() as Arc<dyn MemoryStore>));

    let response = server
        .tool_call_value("s1", &call("memory_store", json!({"key": "orphan"})))
        .await;
    assert_eq!(response["status"], "error");
    assert_eq!(response["error"]["code"], "VALIDATION_FAILED");
    assert!(response["error"]["details"].is_array());
    assert!(memory.entries.lock().is_empty());
}

#[tokio::test]
async fn test_memory_tools_without_store_fail_cleanly() {
    let server = server(None);
    let response = server.tool_call_value("s1", &call("memory_status", json!({}))).await;
    assert_eq!(response["status"], "error");
    assert_eq!(response["error"]["code"], "EXECUTION_FAILED");
    assert_eq!(response["error"]["message"], "memory store is not configured");
}

#[tokio::test]
async fn test_unknown_tool_is_reported() {
    let server = server(None);
    let response = server.tool_call_value("s1", &call("teleport", json!({}))).await;
    assert_eq!(response["error"]["code"], "TOOL_NOT_FOUND");
    assert_eq!(response["error"]["message"], "Tool not found: teleport");
}

#[tokio::test]
async fn test_describe_tool_returns_full_definition_past_listing_ceiling() {
    let server = server(None);
    let response = server
        .tool_call_value("s1", &call("describe_tool", json!({"name": "memory_status"})))
        .await;
    assert_eq!(response["status"], "success", "{response}");
    let definition = &response["result"];
    assert_eq!(definition["name"], "memory_status");
    assert_eq!(definition["inputSchema"]["type"], "object");
    assert_eq!(definition["inputSchema"]["additionalProperties"], false);
}

#[test]
fn test_server_catalog_includes_core_and_manifest_tools() {
    let server = server(None);
    let memory = server.search_tools(&SearchQuery {
        category: Some("memory".to_string()),
        detail_level: Some(DetailLevel::NamesOnly),
        ..SearchQuery::default()
    });
    assert_eq!(memory.len(), 4);

    let all = server.search_tools(&SearchQuery::default());
    assert!(all.iter().any(|t| t["name"] == "search_tools"));
    assert!(all.iter().any(|t| t["name"] == "describe_tool"));
}
