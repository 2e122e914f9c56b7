//! toolhub-mcp: an MCP tool server with progressive tool loading and async jobs
//!
//! The server negotiates protocol versions with its clients, keeps older
//! clients working through a compatibility adapter, discovers tools from JSON
//! manifests without loading them, and runs long tool calls as pollable jobs.
//!
//! # Architecture
//!
//! - **Negotiation**: one handshake per session agrees a version and a
//!   capability set
//! - **Progressive loading**: tool metadata is scanned up front; full
//!   definitions are loaded on first use and cached
//! - **Async jobs**: calls in async mode return a job handle immediately and
//!   report progress until they finish, fail or are cancelled
//!
//! # Modules
//!
//! - [`config`] — Configuration loading and validation
//! - [`error`] — Error types
//! - [`jobs`] — Async job manager and job stores
//! - [`mcp`] — MCP protocol implementation
//! - [`memory`] — Memory store collaborator used by the memory tools
//! - [`registry_client`] — Discovery registry client
//! - [`schema`] — JSON Schema validation with a compiled-schema cache
//! - [`tools`] — Tool catalog, loader and registry

pub mod config;
pub mod error;
pub mod jobs;
pub mod mcp;
pub mod memory;
pub mod registry_client;
pub mod schema;
pub mod tools;
