//! Memory/knowledge store collaborator.
//!
//! The memory tools only talk to this interface. How entries are persisted
//! (files, a database, a remote service) is the implementor's business.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;

/// A stored entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Store-assigned identifier.
    pub id: String,
    /// Caller-chosen key.
    pub key: String,
    /// Stored value.
    pub value: Value,
    /// Namespace the entry belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Relevance score for query results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Options for [`MemoryStore::store`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StoreOptions {
    /// Target namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Tags attached to the entry.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Expiry in seconds.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Options for [`MemoryStore::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueryOptions {
    /// Restrict to one namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Maximum number of results.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Options for [`MemoryStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ListOptions {
    /// Restrict to one namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Maximum number of results.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Number of entries to skip.
    #[serde(default)]
    pub offset: Option<usize>,
}

/// Store statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Total stored entries.
    pub total_entries: u64,
    /// Entry count per namespace.
    #[serde(default)]
    pub namespaces: BTreeMap<String, u64>,
    /// Backend-specific details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Value>,
}

/// Keyed memory/knowledge store used by the memory tools.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Stores `value` under `key` and returns the entry id.
    async fn store(&self, key: &str, value: Value, options: StoreOptions)
        -> Result<String, ToolError>;

    /// Returns entries relevant to `text`.
    async fn query(&self, text: &str, options: QueryOptions)
        -> Result<Vec<MemoryEntry>, ToolError>;

    /// Lists entries.
    async fn list(&self, options: ListOptions) -> Result<Vec<MemoryEntry>, ToolError>;

    /// Returns store statistics.
    async fn status(&self) -> Result<MemoryStats, ToolError>;
}
