//! Model Context Protocol (MCP) server implementation.
//!
//! Exposes a progressively loaded tool catalog and an async job manager to
//! MCP clients. Sessions begin with version negotiation; clients that
//! predate negotiation are adapted transparently.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           MCP Server                             │
//! │                                                                  │
//! │  ┌─────────────┐   ┌─────────────┐   ┌────────────────────────┐  │
//! │  │  Transport  │──▶│  McpServer  │──▶│     ProtocolServer     │  │
//! │  │   (stdio)   │   │  (JSON-RPC) │   │  sessions, dispatch    │  │
//! │  └─────────────┘   └─────────────┘   └────────────────────────┘  │
//! │                                        │      │      │      │    │
//! │                                        ▼      ▼      ▼      ▼    │
//! │                               negotiation compat tools  jobs     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! The server speaks [`MCP_PROTOCOL_VERSION`] and accepts clients within one
//! release cycle of it.

pub mod compat;
pub mod messages;
pub mod negotiation;
pub mod orchestrator;
pub mod protocol;
pub mod server;
pub mod transport;

pub use compat::CompatibilityAdapter;
pub use negotiation::{NegotiationResult, VersionNegotiator};
pub use orchestrator::{HealthReport, HealthStatus, ProtocolServer, ServerMetrics, ServerServices};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
pub use server::McpServer;
pub use transport::{LineTransport, StdioTransport};
