//! Progressive tool discovery and execution.
//!
//! Tools are described by lightweight metadata that is cheap to scan, and
//! are only materialised (manifest parsed, handler constructed, schemas kept
//! in memory) the first time they are needed.
//!
//! ```text
//!   tools/*.json ──scan──▶ ToolMetadata index ──load──▶ Arc<Tool> cache
//!                                   │                        │
//!                              search/list              route_tool_call
//! ```
//!
//! Handlers are never loaded from disk. A manifest names a key in the static
//! [`HandlerTable`], and the table's factory builds the handler on first load.

pub mod handlers;
pub mod loader;
pub mod registry;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;
use crate::jobs::ProgressReporter;
use crate::memory::MemoryStore;

pub use handlers::HandlerTable;
pub use loader::ToolLoader;
pub use registry::{RegistryMetrics, ToolExecution, ToolRegistry};

/// How much of a tool definition a listing returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetailLevel {
    /// Only the tool name.
    NamesOnly,
    /// Name, description, category and tags.
    #[default]
    Basic,
    /// Everything, including input and output schemas.
    Full,
}

impl fmt::Display for DetailLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NamesOnly => write!(f, "names-only"),
            Self::Basic => write!(f, "basic"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// Where a tool definition comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "lowercase")]
pub enum ToolSource {
    /// A JSON manifest on disk.
    Manifest(PathBuf),
    /// Registered in-process at startup.
    Resident,
}

/// Scanned metadata for one tool. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolMetadata {
    /// Unique tool name.
    pub name: String,
    /// One-line description.
    pub description: String,
    /// Grouping used for filtering.
    pub category: String,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// The most detail this tool exposes in listings.
    pub detail_level: DetailLevel,
    /// Where the full definition lives.
    pub file_locator: ToolSource,
}

/// Search filters. Every provided filter must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SearchQuery {
    /// Exact category match.
    #[serde(default)]
    pub category: Option<String>,
    /// Every tag listed here must be present on the tool.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Case-insensitive substring of the name or description.
    #[serde(default, alias = "namePattern")]
    pub name_pattern: Option<String>,
    /// Projection applied to results.
    #[serde(default, alias = "detailLevel")]
    pub detail_level: Option<DetailLevel>,
}

impl SearchQuery {
    /// Returns whether `meta` satisfies every provided filter.
    #[must_use]
    pub fn matches(&self, meta: &ToolMetadata) -> bool {
        if let Some(category) = &self.category {
            if &meta.category != category {
                return false;
            }
        }

        if !self.tags.iter().all(|t| meta.tags.contains(t)) {
            return false;
        }

        if let Some(pattern) = &self.name_pattern {
            let pattern = pattern.to_lowercase();
            if !meta.name.to_lowercase().contains(&pattern)
                && !meta.description.to_lowercase().contains(&pattern)
            {
                return false;
            }
        }

        true
    }
}

/// A fully loaded tool.
pub struct Tool {
    /// Scanned metadata.
    pub metadata: ToolMetadata,
    /// JSON schema for arguments.
    pub input_schema: Value,
    /// Optional JSON schema for results.
    pub output_schema: Option<Value>,
    /// The executable handler.
    pub handler: Arc<dyn ToolHandler>,
}

impl Tool {
    /// Returns the tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("metadata", &self.metadata)
            .field("has_output_schema", &self.output_schema.is_some())
            .finish_non_exhaustive()
    }
}

/// Collaborators shared by every handler invocation.
pub struct ToolServices {
    /// The tool catalogue, for discovery tools.
    pub catalog: Arc<ToolLoader>,
    /// Memory/knowledge store, when one is configured.
    pub memory: Option<Arc<dyn MemoryStore>>,
}

impl ToolServices {
    /// Returns the memory store or a descriptive execution error.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Execution`] if no memory store is configured.
    pub fn memory(&self) -> Result<&Arc<dyn MemoryStore>, ToolError> {
        self.memory
            .as_ref()
            .ok_or_else(|| ToolError::execution("memory store is not configured"))
    }
}

/// Per-invocation context handed to a handler.
#[derive(Clone)]
pub struct ToolContext {
    /// Session that issued the call.
    pub session_id: String,
    /// Shared collaborators.
    pub services: Arc<ToolServices>,
    /// Progress callback, present only under the async path.
    pub progress: Option<ProgressReporter>,
}

impl ToolContext {
    /// Reports progress if the call runs as a job; no-op otherwise.
    pub async fn report_progress(&self, percent: f64, message: impl Into<String> + Send) {
        if let Some(progress) = &self.progress {
            progress.report(percent, message).await;
        }
    }
}

/// A tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Executes the tool.
    async fn call(&self, arguments: Value, context: ToolContext) -> Result<Value, ToolError>;
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn call(&self, arguments: Value, context: ToolContext) -> Result<Value, ToolError> {
        (self.0)(arguments, context).await
    }
}

/// Wraps an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, description: &str, category: &str, tags: &[&str]) -> ToolMetadata {
        ToolMetadata {
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            tags: tags.iter().map(ToString::to_string).collect(),
            detail_level: DetailLevel::Full,
            file_locator: ToolSource::Resident,
        }
    }

    #[test]
    fn tag_filter_requires_all_tags() {
        let query = SearchQuery {
            tags: vec!["a".to_string(), "b".to_string()],
            ..SearchQuery::default()
        };
        assert!(query.matches(&meta("x", "", "c", &["a", "b", "z"])));
        assert!(!query.matches(&meta("y", "", "c", &["a"])));
    }

    #[test]
    fn name_pattern_checks_description_case_insensitively() {
        let query = SearchQuery {
            name_pattern: Some("KNOWLEDGE".to_string()),
            ..SearchQuery::default()
        };
        assert!(query.matches(&meta("memory_query", "Query the knowledge store", "memory", &[])));
        assert!(!query.matches(&meta("echo", "Echo input", "debug", &[])));
    }

    #[test]
    fn filters_are_anded() {
        let query = SearchQuery {
            category: Some("memory".to_string()),
            name_pattern: Some("store".to_string()),
            ..SearchQuery::default()
        };
        assert!(query.matches(&meta("memory_store", "", "memory", &[])));
        assert!(!query.matches(&meta("blob_store", "", "files", &[])));
    }

    #[test]
    fn detail_level_wire_names() {
        let level: DetailLevel = serde_json::from_str("\"names-only\"").unwrap();
        assert_eq!(level, DetailLevel::NamesOnly);
        assert_eq!(DetailLevel::Full.to_string(), "full");
    }

    #[test]
    fn search_query_accepts_camel_case_aliases() {
        let query: SearchQuery =
            serde_json::from_str(r#"{"namePattern": "mem", "detailLevel": "full"}"#).unwrap();
        assert_eq!(query.name_pattern.as_deref(), Some("mem"));
        assert_eq!(query.detail_level, Some(DetailLevel::Full));
    }
}
