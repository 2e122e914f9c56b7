//! Protocol version and capability negotiation.
//!
//! Versions are calendar tokens (`YYYY-MM`). A client version is accepted
//! when it matches the server, appears in the explicit support list, or lies
//! within one release cycle of the server; in the last case the session is
//! pinned to the server's version.
//!
//! ```text
//!   client == server ───────────────▶ client version
//!   client in supported list ───────▶ client version
//!   |client - server| <= 6 months ──▶ server version
//!   otherwise ──────────────────────▶ failure
//! ```

use std::sync::OnceLock;

use indexmap::IndexSet;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::messages::{Handshake, ServerHandshake, Transport};
use super::protocol::MCP_PROTOCOL_VERSION;

/// Capabilities advertised when the configuration names none.
pub const DEFAULT_SERVER_CAPABILITIES: &[&str] = &["async", "registry", "code_exec", "stream"];

/// Older versions accepted verbatim.
pub const SUPPORTED_LEGACY_VERSIONS: &[&str] = &["2025-06", "2025-03", "2024-11"];

/// Length of one protocol release cycle.
pub const RELEASE_CYCLE_MONTHS: i32 = 6;

/// A parsed `YYYY-MM` version token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    /// Calendar year.
    pub year: i32,
    /// Calendar month, 1 to 12.
    pub month: u32,
}

impl ProtocolVersion {
    /// Signed distance in months from `other` to `self`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // month is at most 12
    pub const fn months_since(self, other: Self) -> i32 {
        (self.year - other.year) * 12 + (self.month as i32 - other.month as i32)
    }
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d{4})-(\d{2})$").expect("version pattern is valid"))
}

/// Parses a `YYYY-MM` token.
#[must_use]
pub fn parse_version(token: &str) -> Option<ProtocolVersion> {
    let caps = version_pattern().captures(token.trim())?;
    let year = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    (1..=12)
        .contains(&month)
        .then_some(ProtocolVersion { year, month })
}

/// Result of negotiating one handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiationResult {
    /// Whether a session may be created.
    pub success: bool,
    /// Agreed version; the server's own version on failure.
    pub agreed_version: String,
    /// Agreed capabilities; empty on failure.
    pub agreed_capabilities: Vec<String>,
    /// Why negotiation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Agrees on a version and capability set with each client.
#[derive(Debug, Clone)]
pub struct VersionNegotiator {
    server_version: String,
    supported_versions: Vec<String>,
    capabilities: IndexSet<String>,
}

impl Default for VersionNegotiator {
    fn default() -> Self {
        Self::new(
            MCP_PROTOCOL_VERSION,
            SUPPORTED_LEGACY_VERSIONS.iter().map(ToString::to_string),
            DEFAULT_SERVER_CAPABILITIES.iter().map(ToString::to_string),
        )
    }
}

impl VersionNegotiator {
    /// Creates a negotiator for `server_version`.
    pub fn new(
        server_version: impl Into<String>,
        supported_versions: impl IntoIterator<Item = String>,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            server_version: server_version.into(),
            supported_versions: supported_versions.into_iter().collect(),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// The server's native version.
    #[must_use]
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Currently advertised capabilities, in declaration order.
    #[must_use]
    pub fn capabilities(&self) -> Vec<String> {
        self.capabilities.iter().cloned().collect()
    }

    /// Advertises a capability to future negotiations.
    pub fn add_capability(&mut self, capability: impl Into<String>) -> bool {
        self.capabilities.insert(capability.into())
    }

    /// Withdraws a capability from future negotiations.
    pub fn remove_capability(&mut self, capability: &str) -> bool {
        self.capabilities.shift_remove(capability)
    }

    /// Negotiates a decoded handshake.
    #[must_use]
    pub fn negotiate(&self, handshake: &Handshake) -> NegotiationResult {
        let client = handshake.mcp_version.trim();

        let agreed_version = if client == self.server_version
            || self.supported_versions.iter().any(|v| v == client)
        {
            client.to_string()
        } else {
            let (Some(client_v), Some(server_v)) =
                (parse_version(client), parse_version(&self.server_version))
            else {
                return self.reject(format!(
                    "Invalid protocol version '{client}'. Expected YYYY-MM"
                ));
            };
            let distance = client_v.months_since(server_v);
            if distance.abs() > RELEASE_CYCLE_MONTHS {
                return self.reject(format!(
                    "Incompatible protocol version {client}: server speaks {} and accepts \
                     versions within {RELEASE_CYCLE_MONTHS} months (distance {distance} months)",
                    self.server_version
                ));
            }
            tracing::debug!(client, server = %self.server_version, distance, "Pinning session to server version");
            self.server_version.clone()
        };

        let agreed_capabilities = handshake
            .capabilities
            .iter()
            .filter(|c| self.capabilities.contains(c.as_str()))
            .cloned()
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();

        NegotiationResult {
            success: true,
            agreed_version,
            agreed_capabilities,
            error: None,
        }
    }

    /// Negotiates a raw handshake; malformed input fails negotiation.
    #[must_use]
    pub fn negotiate_value(&self, handshake: &Value) -> NegotiationResult {
        match Handshake::from_value(handshake) {
            Ok(hs) => self.negotiate(&hs),
            Err(reason) => self.reject(format!("Malformed handshake: {reason}")),
        }
    }

    /// A failed result carrying `error`.
    #[must_use]
    pub fn reject(&self, error: impl Into<String>) -> NegotiationResult {
        NegotiationResult {
            success: false,
            agreed_version: self.server_version.clone(),
            agreed_capabilities: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Builds the server handshake from the current version and capabilities.
    ///
    /// Callers overwrite version and capabilities with negotiated values.
    #[must_use]
    pub fn create_server_handshake(
        &self,
        server_id: impl Into<String>,
        transport: Transport,
        metadata: Option<Value>,
    ) -> ServerHandshake {
        ServerHandshake {
            mcp_version: self.server_version.clone(),
            transport,
            capabilities: self.capabilities(),
            server_id: server_id.into(),
            metadata,
        }
    }
}
