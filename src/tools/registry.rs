//! Progressive tool registry.
//!
//! Wraps the [`ToolLoader`] with execution routing and usage metrics. The
//! registry never holds a lock while a handler runs.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use super::handlers::core_tools;
use super::{DetailLevel, SearchQuery, Tool, ToolContext, ToolLoader, ToolServices};
use crate::error::ToolError;
use crate::jobs::ProgressReporter;

/// Token estimate used for a tool whose schemas have not been loaded yet.
const UNLOADED_SCHEMA_TOKENS: usize = 200;

/// Result of a routed tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecution {
    /// Handler output.
    pub result: Value,
    /// Wall-clock execution time.
    pub duration_ms: u64,
}

/// Registry usage metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryMetrics {
    /// Tools discovered by scanning plus resident tools.
    pub total_tools: usize,
    /// Tools currently materialised.
    pub loaded_tools: usize,
    /// Always-resident core tools.
    pub core_tools: usize,
    /// Routed calls, successful or not.
    pub calls: u64,
    /// Routed calls that failed.
    pub failed_calls: u64,
    /// Mean duration of routed calls.
    pub avg_duration_ms: f64,
    /// Estimated tokens to list every tool with full schemas.
    pub full_listing_tokens: usize,
    /// Estimated tokens to list every tool by name only.
    pub names_only_tokens: usize,
    /// Percentage saved by names-only listings over full listings.
    pub token_reduction_percent: f64,
}

#[derive(Default)]
struct CallStats {
    calls: u64,
    failed: u64,
    total_ms: u64,
}

/// Lazily loading tool registry with execution routing.
pub struct ToolRegistry {
    loader: Arc<ToolLoader>,
    services: Arc<ToolServices>,
    stats: Mutex<CallStats>,
}

impl ToolRegistry {
    /// Creates a registry around `services.catalog`.
    #[must_use]
    pub fn new(services: ToolServices) -> Self {
        Self {
            loader: Arc::clone(&services.catalog),
            services: Arc::new(services),
            stats: Mutex::new(CallStats::default()),
        }
    }

    /// Scans tool metadata and registers the resident core tools.
    ///
    /// Returns the number of tools discovered.
    pub fn initialize(&self) -> usize {
        self.loader.scan_tools();
        for tool in core_tools() {
            self.loader.register_resident(tool);
        }
        let total = self.loader.discovered_count();
        tracing::info!(
            total,
            resident = self.loader.resident_count(),
            "Tool registry initialised"
        );
        total
    }

    /// Registers an additional always-resident tool.
    pub fn register_resident(&self, tool: Tool) -> Arc<Tool> {
        self.loader.register_resident(tool)
    }

    /// Returns the tool, loading it on first use. Soft-fails to `None`.
    #[must_use]
    pub fn get_tool(&self, name: &str) -> Option<Arc<Tool>> {
        match self.loader.load_tool(name) {
            Ok(tool) => Some(tool),
            Err(ToolError::NotFound(_)) => None,
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "Tool failed to load");
                None
            }
        }
    }

    /// Resolves a tool, surfacing the reason on failure.
    ///
    /// # Errors
    ///
    /// Returns the loader's error for unknown or broken tools.
    pub fn resolve(&self, name: &str) -> Result<Arc<Tool>, ToolError> {
        self.loader.load_tool(name)
    }

    /// Builds a handler context for `session_id`.
    #[must_use]
    pub fn context(&self, session_id: &str, progress: Option<ProgressReporter>) -> ToolContext {
        ToolContext {
            session_id: session_id.to_string(),
            services: Arc::clone(&self.services),
            progress,
        }
    }

    /// Resolves and executes a tool.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::NotFound`] for unknown tools, or the handler's error.
    pub async fn route_tool_call(
        &self,
        name: &str,
        arguments: Value,
        context: ToolContext,
    ) -> Result<ToolExecution, ToolError> {
        let tool = self.resolve(name)?;
        self.execute(&tool, arguments, context).await
    }

    /// Executes an already resolved tool and records its duration.
    ///
    /// # Errors
    ///
    /// Returns the handler's error.
    pub async fn execute(
        &self,
        tool: &Tool,
        arguments: Value,
        context: ToolContext,
    ) -> Result<ToolExecution, ToolError> {
        let started = Instant::now();
        let outcome = tool.handler.call(arguments, context).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        {
            let mut stats = self.stats.lock();
            stats.calls += 1;
            stats.total_ms = stats.total_ms.saturating_add(duration_ms);
            if outcome.is_err() {
                stats.failed += 1;
            }
        }

        match outcome {
            Ok(result) => {
                tracing::debug!(tool = tool.name(), duration_ms, "Tool call succeeded");
                Ok(ToolExecution {
                    result,
                    duration_ms,
                })
            }
            Err(e) => {
                tracing::warn!(tool = tool.name(), duration_ms, error = %e, "Tool call failed");
                Err(e)
            }
        }
    }

    /// Searches and projects tools.
    #[must_use]
    pub fn search(&self, query: &SearchQuery) -> Vec<Value> {
        self.loader.describe_tools(query)
    }

    /// Clears loaded tools and rescans manifests. Resident tools stay.
    pub fn reload(&self) -> usize {
        self.loader.reload();
        self.loader.discovered_count()
    }

    /// Returns the underlying loader.
    #[must_use]
    pub const fn loader(&self) -> &Arc<ToolLoader> {
        &self.loader
    }

    /// Computes current metrics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // counts are far below 2^52
    pub fn metrics(&self) -> RegistryMetrics {
        let all = self.loader.search_tools(&SearchQuery::default());

        let mut full_tokens = 0;
        let mut names_tokens = 0;
        for meta in &all {
            names_tokens += estimate_tokens(&json!({ "name": meta.name }));
            full_tokens += match self.loader.cached(&meta.name) {
                Some(_) => estimate_tokens(&self.loader.describe(meta, DetailLevel::Full)),
                None => {
                    estimate_tokens(&self.loader.describe(meta, DetailLevel::Basic))
                        + UNLOADED_SCHEMA_TOKENS
                }
            };
        }

        let reduction = if full_tokens == 0 {
            0.0
        } else {
            (1.0 - names_tokens as f64 / full_tokens as f64) * 100.0
        };

        let stats = self.stats.lock();
        RegistryMetrics {
            total_tools: all.len(),
            loaded_tools: self.loader.loaded_count(),
            core_tools: self.loader.resident_count(),
            calls: stats.calls,
            failed_calls: stats.failed,
            avg_duration_ms: if stats.calls == 0 {
                0.0
            } else {
                stats.total_ms as f64 / stats.calls as f64
            },
            full_listing_tokens: full_tokens,
            names_only_tokens: names_tokens,
            token_reduction_percent: reduction,
        }
    }
}

/// Rough token count of a JSON value (four bytes per token).
fn estimate_tokens(value: &Value) -> usize {
    value.to_string().len().div_ceil(4)
}
