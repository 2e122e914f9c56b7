//! Static handler table and the builtin handlers.
//!
//! Manifests refer to handlers by key. The table maps each key to a factory
//! that builds the handler when the tool is first loaded, so any expensive
//! set-up happens on first use rather than at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{DetailLevel, SearchQuery, Tool, ToolContext, ToolHandler, ToolMetadata, ToolSource};
use crate::error::ToolError;
use crate::memory::{ListOptions, QueryOptions, StoreOptions};
use crate::schema::SCHEMA_DIALECT;

/// Builds a handler instance.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn ToolHandler> + Send + Sync>;

/// Maps manifest handler keys to handler factories.
#[derive(Default)]
pub struct HandlerTable {
    factories: BTreeMap<String, HandlerFactory>,
}

impl HandlerTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table holding the builtin memory handlers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register("memory_store", || Arc::new(MemoryStoreHandler));
        table.register("memory_query", || Arc::new(MemoryQueryHandler));
        table.register("memory_list", || Arc::new(MemoryListHandler));
        table.register("memory_status", || Arc::new(MemoryStatusHandler));
        table
    }

    /// Registers (or replaces) the factory for `key`.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn ToolHandler> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    /// Builds the handler registered under `key`.
    #[must_use]
    pub fn instantiate(&self, key: &str) -> Option<Arc<dyn ToolHandler>> {
        self.factories.get(key).map(|factory| factory())
    }

    /// Returns whether `key` is registered.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments)
        .map_err(|e| ToolError::execution(format!("invalid arguments: {e}")))
}

fn core_metadata(name: &str, description: &str, tags: &[&str]) -> ToolMetadata {
    ToolMetadata {
        name: name.to_string(),
        description: description.to_string(),
        category: "core".to_string(),
        tags: tags.iter().map(ToString::to_string).collect(),
        detail_level: DetailLevel::Full,
        file_locator: ToolSource::Resident,
    }
}

/// Builds the always-resident core tools.
#[must_use]
pub fn core_tools() -> Vec<Tool> {
    vec![
        Tool {
            metadata: core_metadata(
                "search_tools",
                "Search available tools by category, tags or name, at a chosen detail level",
                &["discovery", "core"],
            ),
            input_schema: json!({
                "$schema": SCHEMA_DIALECT,
                "type": "object",
                "properties": {
                    "category": { "type": "string" },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "name_pattern": { "type": "string" },
                    "namePattern": { "type": "string" },
                    "detail_level": { "enum": ["names-only", "basic", "full"] },
                    "detailLevel": { "enum": ["names-only", "basic", "full"] }
                },
                "additionalProperties": false
            }),
            output_schema: Some(json!({
                "$schema": SCHEMA_DIALECT,
                "type": "object",
                "properties": {
                    "tools": { "type": "array" },
                    "count": { "type": "integer", "minimum": 0 },
                    "detail_level": { "type": "string" }
                },
                "required": ["tools", "count"]
            })),
            handler: Arc::new(SearchToolsHandler),
        },
        Tool {
            metadata: core_metadata(
                "describe_tool",
                "Return the full definition of one tool, including its schemas",
                &["discovery", "core"],
            ),
            input_schema: json!({
                "$schema": SCHEMA_DIALECT,
                "type": "object",
                "properties": { "name": { "type": "string", "minLength": 1 } },
                "required": ["name"],
                "additionalProperties": false
            }),
            output_schema: None,
            handler: Arc::new(DescribeToolHandler),
        },
    ]
}

/// Searches the catalogue and projects results to the requested detail level.
struct SearchToolsHandler;

#[async_trait]
impl ToolHandler for SearchToolsHandler {
    async fn call(&self, arguments: Value, context: ToolContext) -> Result<Value, ToolError> {
        let query: SearchQuery = parse_args(arguments)?;
        let level = query.detail_level.unwrap_or_default();
        let tools = context.services.catalog.describe_tools(&query);
        let count = tools.len();
        Ok(json!({
            "tools": tools,
            "count": count,
            "detail_level": level,
        }))
    }
}

#[derive(Deserialize)]
struct DescribeArgs {
    name: String,
}

struct DescribeToolHandler;

#[async_trait]
impl ToolHandler for DescribeToolHandler {
    async fn call(&self, arguments: Value, context: ToolContext) -> Result<Value, ToolError> {
        let args: DescribeArgs = parse_args(arguments)?;
        let catalog = &context.services.catalog;
        let meta = catalog
            .metadata(&args.name)
            .ok_or_else(|| ToolError::NotFound(args.name.clone()))?;
        Ok(catalog.definition(&meta))
    }
}

#[derive(Deserialize)]
struct StoreArgs {
    key: String,
    value: Value,
    #[serde(flatten)]
    options: StoreOptions,
}

struct MemoryStoreHandler;

#[async_trait]
impl ToolHandler for MemoryStoreHandler {
    async fn call(&self, arguments: Value, context: ToolContext) -> Result<Value, ToolError> {
        let args: StoreArgs = parse_args(arguments)?;
        let store = context.services.memory()?;
        let id = store.store(&args.key, args.value, args.options).await?;
        Ok(json!({ "id": id, "key": args.key }))
    }
}

#[derive(Deserialize)]
struct QueryArgs {
    query: String,
    #[serde(flatten)]
    options: QueryOptions,
}

struct MemoryQueryHandler;

#[async_trait]
impl ToolHandler for MemoryQueryHandler {
    async fn call(&self, arguments: Value, context: ToolContext) -> Result<Value, ToolError> {
        let args: QueryArgs = parse_args(arguments)?;
        let store = context.services.memory()?;
        let entries = store.query(&args.query, args.options).await?;
        let count = entries.len();
        Ok(json!({ "count": count, "entries": entries }))
    }
}

struct MemoryListHandler;

#[async_trait]
impl ToolHandler for MemoryListHandler {
    async fn call(&self, arguments: Value, context: ToolContext) -> Result<Value, ToolError> {
        let options: ListOptions = parse_args(arguments)?;
        let store = context.services.memory()?;
        let entries = store.list(options).await?;
        let count = entries.len();
        Ok(json!({ "count": count, "entries": entries }))
    }
}

struct MemoryStatusHandler;

#[async_trait]
impl ToolHandler for MemoryStatusHandler {
    async fn call(&self, _arguments: Value, context: ToolContext) -> Result<Value, ToolError> {
        let stats = context.services.memory()?.status().await?;
        serde_json::to_value(stats).map_err(|e| ToolError::execution(e.to_string()))
    }
}
