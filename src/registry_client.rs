//! Discovery-registry client.
//!
//! Registers this server with an HTTP discovery service, keeps its metadata
//! current and reports health periodically. Every operation is best-effort:
//! failures are logged and swallowed so they never affect protocol serving.
//!
//! ```text
//!   POST   {url}/servers               register
//!   PATCH  {url}/servers/{id}          update_metadata
//!   POST   {url}/servers/{id}/health   report_health
//!   GET    {url}/servers?capability=   search_servers
//!   DELETE {url}/servers/{id}          unregister
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::{RegistryConfig, ServerConfig};
use crate::error::RegistryClientError;
use crate::mcp::messages::Transport;
use crate::mcp::orchestrator::{HealthReport, ProtocolServer};
use crate::mcp::protocol::MCP_PROTOCOL_VERSION;

/// Something that can produce a health snapshot.
#[async_trait]
pub trait HealthSource: Send + Sync {
    /// Takes a health snapshot.
    async fn health(&self) -> HealthReport;
}

#[async_trait]
impl HealthSource for ProtocolServer {
    async fn health(&self) -> HealthReport {
        self.health_check().await
    }
}

/// Registration document sent to the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerRegistration {
    /// Server identity.
    pub server_id: String,
    /// Where clients can reach this server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Native protocol version.
    pub mcp_version: String,
    /// Served transport.
    pub transport: Transport,
    /// Advertised capabilities.
    pub capabilities: Vec<String>,
    /// Package version.
    pub version: String,
}

/// A server listed by the registry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerRecord {
    /// Server identity.
    pub server_id: String,
    /// Endpoint, if published.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Protocol version.
    #[serde(default)]
    pub mcp_version: Option<String>,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Last reported health status.
    #[serde(default)]
    pub status: Option<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Filter for [`RegistryClient::search_servers`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerQuery {
    /// Servers advertising this capability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Free-text search.
    #[serde(rename = "q", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Maximum results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
struct RegisterResponse {
    #[serde(default, alias = "registration_id")]
    id: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Bare(Vec<ServerRecord>),
    Wrapped { servers: Vec<ServerRecord> },
}

/// HTTP client for the discovery registry.
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    registration: ServerRegistration,
    registration_id: RwLock<Option<String>>,
}

impl RegistryClient {
    /// Creates a client for the configured registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryClientError::Http`] if the HTTP client cannot be built.
    pub fn new(
        registry: &RegistryConfig,
        server: &ServerConfig,
    ) -> Result<Self, RegistryClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(registry.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: registry
                .url
                .as_deref()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            registration: ServerRegistration {
                server_id: server.server_id.clone(),
                endpoint: registry.endpoint.clone(),
                mcp_version: MCP_PROTOCOL_VERSION.to_string(),
                transport: server.transport,
                capabilities: server.capabilities.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            registration_id: RwLock::new(None),
        })
    }

    /// The id assigned at registration.
    #[must_use]
    pub fn registration_id(&self) -> Option<String> {
        self.registration_id.read().clone()
    }

    /// Registers this server. Returns whether it succeeded.
    pub async fn register(&self) -> bool {
        match self.try_register().await {
            Ok(id) => {
                tracing::info!(registration_id = %id, registry = %self.base_url, "Registered with discovery registry");
                *self.registration_id.write() = Some(id);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, registry = %self.base_url, "Registry registration failed");
                false
            }
        }
    }

    async fn try_register(&self) -> Result<String, RegistryClientError> {
        let response = self
            .http
            .post(format!("{}/servers", self.base_url))
            .json(&self.registration)
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: RegisterResponse = response.json().await.unwrap_or(RegisterResponse { id: None });
        Ok(body
            .id
            .unwrap_or_else(|| self.registration.server_id.clone()))
    }

    /// Merges `patch` into the registered metadata.
    pub async fn update_metadata(&self, patch: &Value) -> bool {
        let result = async {
            let url = self.server_url("")?;
            let response = self.http.patch(url).json(patch).send().await?;
            check_status(response).await.map(drop)
        }
        .await;
        log_outcome("update_metadata", result)
    }

    /// Sends one health snapshot.
    pub async fn report_health(&self, report: &HealthReport) -> bool {
        let result = async {
            let url = self.server_url("/health")?;
            let response = self.http.post(url).json(report).send().await?;
            check_status(response).await.map(drop)
        }
        .await;
        log_outcome("report_health", result)
    }

    /// Finds other servers. Returns an empty list on failure.
    pub async fn search_servers(&self, query: &ServerQuery) -> Vec<ServerRecord> {
        let result = async {
            let response = self
                .http
                .get(format!("{}/servers", self.base_url))
                .query(query)
                .send()
                .await?;
            let response = check_status(response).await?;
            Ok::<_, RegistryClientError>(match response.json::<SearchResponse>().await? {
                SearchResponse::Bare(servers) | SearchResponse::Wrapped { servers } => servers,
            })
        }
        .await;

        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Registry search failed");
            Vec::new()
        })
    }

    /// Removes the registration.
    pub async fn unregister(&self) -> bool {
        let result = async {
            let url = self.server_url("")?;
            let response = self.http.delete(url).send().await?;
            check_status(response).await.map(drop)
        }
        .await;
        let ok = log_outcome("unregister", result);
        if ok {
            *self.registration_id.write() = None;
        }
        ok
    }

    /// Starts reporting `source`'s health every `period`.
    #[must_use]
    pub fn start_health_reporting(
        self: &Arc<Self>,
        source: Arc<dyn HealthSource>,
        period: Duration,
    ) -> HealthReporterHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let client = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            tracing::info!(interval_secs = period.as_secs(), "Registry health reporting started");
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let report = source.health().await;
                        client.report_health(&report).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        HealthReporterHandle {
            shutdown_tx,
            task: Some(task),
        }
    }

    fn server_url(&self, suffix: &str) -> Result<String, RegistryClientError> {
        let id = self
            .registration_id
            .read()
            .clone()
            .ok_or(RegistryClientError::NotRegistered)?;
        Ok(format!("{}/servers/{id}{suffix}", self.base_url))
    }
}

/// Handle for the health reporting loop.
pub struct HealthReporterHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl HealthReporterHandle {
    /// Stops the loop and waits for it to exit.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Health reporting task ended abnormally");
            }
        }
        tracing::info!("Registry health reporting stopped");
    }

    /// Whether the loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RegistryClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RegistryClientError::Status {
        status: status.as_u16(),
        body,
    })
}

fn log_outcome(operation: &str, result: Result<(), RegistryClientError>) -> bool {
    match result {
        Ok(()) => {
            tracing::debug!(operation, "Registry call succeeded");
            true
        }
        Err(e) => {
            tracing::warn!(operation, error = %e, "Registry call failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStats;
    use crate::mcp::orchestrator::HealthStatus;
    use mockito::Matcher;
    use serde_json::json;

    fn client(url: &str) -> RegistryClient {
        let registry = RegistryConfig {
            enabled: true,
            url: Some(url.to_string()),
            endpoint: Some("stdio://toolhub".to_string()),
            health_interval_secs: 1,
            timeout_secs: 2,
        };
        RegistryClient::new(&registry, &ServerConfig::default()).unwrap()
    }

    fn report() -> HealthReport {
        HealthReport {
            status: HealthStatus::Healthy,
            latency_ms: 1,
            sessions: 0,
            tools: 2,
            jobs: JobStats::default(),
            uptime_secs: 5,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_stores_assigned_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/servers")
            .match_body(Matcher::PartialJson(json!({
                "server_id": "toolhub-mcp",
                "mcp_version": "2025-11",
                "transport": "stdio"
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "reg-1"}"#)
            .create_async()
            .await;

        let client = client(&server.url());
        assert!(client.register().await);
        assert_eq!(client.registration_id().as_deref(), Some("reg-1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/servers")
            .with_status(500)
            .with_body("down")
            .create_async()
            .await;

        let client = client(&server.url());
        assert!(!client.register().await);
        assert!(client.registration_id().is_none());
        assert!(!client.report_health(&report()).await);
        assert!(!client.update_metadata(&json!({"region": "eu"})).await);
    }

    #[tokio::test]
    async fn health_and_unregister_use_registration_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/servers")
            .with_status(200)
            .with_body(r#"{"id": "abc"}"#)
            .create_async()
            .await;
        let health = server
            .mock("POST", "/servers/abc/health")
            .match_body(Matcher::PartialJson(json!({"status": "healthy"})))
            .with_status(204)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/servers/abc")
            .with_status(200)
            .create_async()
            .await;

        let client = client(&server.url());
        assert!(client.register().await);
        assert!(client.report_health(&report()).await);
        assert!(client.unregister().await);
        assert!(client.registration_id().is_none());
        health.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn search_accepts_both_shapes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/servers")
            .match_query(Matcher::UrlEncoded("capability".into(), "async".into()))
            .with_status(200)
            .with_body(r#"{"servers": [{"server_id": "a", "capabilities": ["async"]}]}"#)
            .create_async()
            .await;

        let client = client(&server.url());
        let found = client
            .search_servers(&ServerQuery {
                capability: Some("async".to_string()),
                ..ServerQuery::default()
            })
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].server_id, "a");

        let none = client.search_servers(&ServerQuery::default()).await;
        assert!(none.is_empty());
    }

    struct FixedHealth;

    #[async_trait]
    impl HealthSource for FixedHealth {
        async fn health(&self) -> HealthReport {
            report()
        }
    }

    #[tokio::test]
    async fn health_loop_starts_and_stops() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/servers")
            .with_status(200)
            .with_body(r#"{"id": "loop"}"#)
            .create_async()
            .await;
        let health = server
            .mock("POST", "/servers/loop/health")
            .with_status(200)
            .expect_at_least(1)
            .create_async()
            .await;

        let client = Arc::new(client(&server.url()));
        assert!(client.register().await);
        let mut handle = client.start_health_reporting(Arc::new(FixedHealth), Duration::from_secs(60));
        assert!(handle.is_running());
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop().await;
        assert!(!handle.is_running());
        health.assert_async().await;
    }
}
