//! Tool manifest discovery and lazy loading.
//!
//! A manifest is a JSON file anywhere under the tools directory:
//!
//! ```json
//! {
//!   "name": "memory_store",
//!   "description": "Store a value under a key",
//!   "category": "memory",
//!   "tags": ["memory", "write"],
//!   "handler": "memory_store",
//!   "input_schema": { "type": "object", "properties": { "key": { "type": "string" } } }
//! }
//! ```
//!
//! Scanning reads only the header fields. The handler is constructed and the
//! schemas are kept only when the tool is loaded.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{DetailLevel, HandlerTable, SearchQuery, Tool, ToolMetadata, ToolSource};
use crate::error::ToolError;

/// Header fields read during a scan.
#[derive(Deserialize)]
struct ManifestHeader {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    detail_level: Option<DetailLevel>,
}

/// Fields read when a tool is loaded.
#[derive(Deserialize)]
struct ManifestBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    handler: Option<String>,
    #[serde(default)]
    input_schema: Option<Value>,
    #[serde(default)]
    output_schema: Option<Value>,
}

type MetadataIndex = BTreeMap<String, ToolMetadata>;

/// Scans tool manifests and loads tools on demand.
///
/// The metadata index is memoized after the first scan; loaded tools are
/// cached until [`ToolLoader::reload`]. Resident tools live outside both and
/// survive reloads.
pub struct ToolLoader {
    root: Option<PathBuf>,
    handlers: Arc<HandlerTable>,
    index: RwLock<Option<Arc<MetadataIndex>>>,
    resident: RwLock<BTreeMap<String, Arc<Tool>>>,
    loaded: RwLock<HashMap<String, Arc<Tool>>>,
    loads: AtomicU64,
}

impl ToolLoader {
    /// Creates a loader over `root` (no manifests when `None`).
    #[must_use]
    pub fn new(root: Option<PathBuf>, handlers: Arc<HandlerTable>) -> Self {
        Self {
            root,
            handlers,
            index: RwLock::new(None),
            resident: RwLock::new(BTreeMap::new()),
            loaded: RwLock::new(HashMap::new()),
            loads: AtomicU64::new(0),
        }
    }

    /// Scans the manifest tree once and returns the metadata index.
    ///
    /// Later calls return the memoized index until [`ToolLoader::reload`].
    pub fn scan_tools(&self) -> Arc<BTreeMap<String, ToolMetadata>> {
        if let Some(index) = self.index.read().as_ref() {
            return Arc::clone(index);
        }

        let mut slot = self.index.write();
        if let Some(index) = slot.as_ref() {
            return Arc::clone(index);
        }

        let index = Arc::new(self.root.as_deref().map(scan_dir).unwrap_or_default());
        tracing::info!(tools = index.len(), "Scanned tool manifests");
        *slot = Some(Arc::clone(&index));
        index
    }

    /// Clears loaded tools and the metadata index, then rescans.
    pub fn reload(&self) -> Arc<BTreeMap<String, ToolMetadata>> {
        self.loaded.write().clear();
        *self.index.write() = None;
        self.scan_tools()
    }

    /// Registers a tool that is always loaded and never evicted.
    pub fn register_resident(&self, tool: Tool) -> Arc<Tool> {
        let tool = Arc::new(tool);
        self.resident
            .write()
            .insert(tool.name().to_string(), Arc::clone(&tool));
        tool
    }

    /// Loads a tool, returning the cached instance on repeat calls.
    ///
    /// # Errors
    ///
    /// - [`ToolError::NotFound`] if no manifest declares `name`
    /// - [`ToolError::Load`] if the manifest cannot be read or parsed
    /// - [`ToolError::NoHandler`] if the manifest names no registered handler
    pub fn load_tool(&self, name: &str) -> Result<Arc<Tool>, ToolError> {
        if let Some(tool) = self.cached(name) {
            return Ok(tool);
        }

        let index = self.scan_tools();
        let meta = index
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let ToolSource::Manifest(path) = &meta.file_locator else {
            return Err(ToolError::NotFound(name.to_string()));
        };

        let body: ManifestBody = read_manifest(path).map_err(|reason| ToolError::Load {
            name: name.to_string(),
            reason,
        })?;

        if let Some(declared) = body.name.as_deref() {
            if declared != name {
                tracing::warn!(
                    key = name,
                    declared,
                    path = %path.display(),
                    "Tool manifest name does not match its index key"
                );
            }
        }

        let handler = body
            .handler
            .as_deref()
            .and_then(|key| self.handlers.instantiate(key))
            .ok_or_else(|| ToolError::NoHandler {
                name: name.to_string(),
            })?;

        let tool = Tool {
            metadata: meta.clone(),
            input_schema: body
                .input_schema
                .unwrap_or_else(
                    || json!({ "type": "object", "properties": {}, "additionalProperties": true }),
                ),
            output_schema: body.output_schema,
            handler,
        };

        self.loads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(tool = name, "Loaded tool");

        // A concurrent load may have won; keep the first instance.
        let tool = Arc::clone(
            self.loaded
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tool)),
        );
        Ok(tool)
    }

    /// Returns a resident or already-loaded tool without touching disk.
    #[must_use]
    pub fn cached(&self, name: &str) -> Option<Arc<Tool>> {
        if let Some(tool) = self.resident.read().get(name) {
            return Some(Arc::clone(tool));
        }
        self.loaded.read().get(name).cloned()
    }

    /// Returns metadata for `name`, resident tools first.
    #[must_use]
    pub fn metadata(&self, name: &str) -> Option<ToolMetadata> {
        if let Some(tool) = self.resident.read().get(name) {
            return Some(tool.metadata.clone());
        }
        self.scan_tools().get(name).cloned()
    }

    /// Returns all metadata matching `query`, sorted by name.
    #[must_use]
    pub fn search_tools(&self, query: &SearchQuery) -> Vec<ToolMetadata> {
        self.all_metadata()
            .into_values()
            .filter(|meta| query.matches(meta))
            .collect()
    }

    /// Searches and projects every result to the query's detail level.
    #[must_use]
    pub fn describe_tools(&self, query: &SearchQuery) -> Vec<Value> {
        let level = query.detail_level.unwrap_or_default();
        self.search_tools(query)
            .iter()
            .map(|meta| self.describe(meta, level))
            .collect()
    }

    /// Projects one tool to `level`, capped at the manifest's
    /// `detail_level`. `Full` loads the tool if needed; a failed load is
    /// reported inline instead of dropping the entry.
    #[must_use]
    pub fn describe(&self, meta: &ToolMetadata, level: DetailLevel) -> Value {
        self.project(meta, level.min(meta.detail_level))
    }

    /// The full definition of one tool. The manifest's `detail_level` only
    /// limits listings, not a lookup by name.
    #[must_use]
    pub fn definition(&self, meta: &ToolMetadata) -> Value {
        self.project(meta, DetailLevel::Full)
    }

    fn project(&self, meta: &ToolMetadata, level: DetailLevel) -> Value {
        match level {
            DetailLevel::NamesOnly => json!({ "name": meta.name }),
            DetailLevel::Basic => basic_description(meta),
            DetailLevel::Full => {
                let mut value = basic_description(meta);
                match self.load_tool(&meta.name) {
                    Ok(tool) => {
                        value["inputSchema"] = tool.input_schema.clone();
                        if let Some(output) = &tool.output_schema {
                            value["outputSchema"] = output.clone();
                        }
                    }
                    Err(e) => {
                        value["loadError"] = Value::from(e.to_string());
                    }
                }
                value
            }
        }
    }

    /// Number of distinct tools known (scanned plus resident).
    #[must_use]
    pub fn discovered_count(&self) -> usize {
        self.all_metadata().len()
    }

    /// Number of tools currently materialised (loaded plus resident).
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        let resident = self.resident.read();
        let extra = self
            .loaded
            .read()
            .keys()
            .filter(|name| !resident.contains_key(*name))
            .count();
        resident.len() + extra
    }

    /// Number of resident tools.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.resident.read().len()
    }

    /// Number of manifest loads performed (cache hits excluded).
    #[must_use]
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    fn all_metadata(&self) -> BTreeMap<String, ToolMetadata> {
        let mut all: BTreeMap<String, ToolMetadata> = self.scan_tools().as_ref().clone();
        for (name, tool) in self.resident.read().iter() {
            all.insert(name.clone(), tool.metadata.clone());
        }
        all
    }
}

fn basic_description(meta: &ToolMetadata) -> Value {
    json!({
        "name": meta.name,
        "description": meta.description,
        "category": meta.category,
        "tags": meta.tags,
    })
}

fn read_manifest<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&contents).map_err(|e| e.to_string())
}

/// Walks `root` for `*.json` manifests. Unreadable paths and manifests
/// without the expected header are logged and skipped.
fn scan_dir(root: &Path) -> MetadataIndex {
    let mut index = MetadataIndex::new();

    let pattern = root.join("**").join("*.json");
    let pattern = pattern.to_string_lossy();
    let entries = match glob::glob(&pattern) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %e, "Invalid tool directory pattern");
            return index;
        }
    };

    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(
                    path = %e.path().display(),
                    error = %e.error(),
                    "Failed to list tool directory, skipping"
                );
                continue;
            }
        };

        let header: ManifestHeader = match read_manifest(&path) {
            Ok(header) => header,
            Err(reason) => {
                tracing::warn!(path = %path.display(), %reason, "Unreadable tool manifest, skipping");
                continue;
            }
        };

        let (Some(name), Some(description)) = (header.name, header.description) else {
            tracing::warn!(
                path = %path.display(),
                "Tool manifest lacks name or description, skipping"
            );
            continue;
        };

        if let Some(existing) = index.get(&name) {
            tracing::warn!(
                tool = %name,
                kept = ?existing.file_locator,
                skipped = %path.display(),
                "Duplicate tool name, keeping the first manifest"
            );
            continue;
        }

        index.insert(
            name.clone(),
            ToolMetadata {
                name,
                description,
                category: header.category.unwrap_or_else(|| "general".to_string()),
                tags: header.tags,
                detail_level: header.detail_level.unwrap_or(DetailLevel::Full),
                file_locator: ToolSource::Manifest(path),
            },
        );
    }

    index
}
