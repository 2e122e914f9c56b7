//! The protocol server: one entry point for handshakes and tool calls.
//!
//! Owns the negotiator, the compatibility adapter, the tool registry, the
//! schema validator and the job manager, plus the session table.
//!
//! ```text
//!   no session ──handshake──▶ handshaking ──negotiated──▶ established
//!                                  │
//!                                  └──rejected──▶ no session
//! ```
//!
//! A session is written once by its own handshake and only read afterwards,
//! until [`ProtocolServer::end_session`] removes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use super::compat::CompatibilityAdapter;
use super::messages::{
    CallMode, ClientHandshake, LegacyHandshake, LegacyToolCall, ServerHandshake, Session, ToolCall,
    ToolCallRequest, ToolCallResponse,
};
use super::negotiation::{NegotiationResult, VersionNegotiator};
use super::protocol::MCP_PROTOCOL_VERSION;
use crate::config::{Config, ServerConfig};
use crate::error::{ErrorPayload, JobError, ToolError};
use crate::jobs::{
    InMemoryJobStore, Job, JobEvent, JobFilter, JobManager, JobPoll, JobRequest, JobResume,
    JobStats, JobStore,
};
use crate::memory::MemoryStore;
use crate::schema::SchemaValidator;
use crate::tools::{
    HandlerTable, RegistryMetrics, SearchQuery, Tool, ToolLoader, ToolRegistry, ToolServices,
};

/// Capability that enables async tool calls.
pub const ASYNC_CAPABILITY: &str = "async";

/// Latency below which the server reports healthy.
pub const HEALTHY_LATENCY: Duration = Duration::from_millis(100);

/// Latency below which the server reports degraded rather than unhealthy.
pub const DEGRADED_LATENCY: Duration = Duration::from_millis(500);

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Under 100 ms.
    Healthy,
    /// Under 500 ms.
    Degraded,
    /// 500 ms or more.
    Unhealthy,
}

impl HealthStatus {
    /// Classifies a measured round-trip latency.
    #[must_use]
    pub fn from_latency(latency: Duration) -> Self {
        if latency < HEALTHY_LATENCY {
            Self::Healthy
        } else if latency < DEGRADED_LATENCY {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }
}

/// A health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Classification of `latency_ms`; `unhealthy` when the job store fails.
    pub status: HealthStatus,
    /// Measured internal round-trip.
    pub latency_ms: u64,
    /// Established sessions.
    pub sessions: usize,
    /// Discovered tools.
    pub tools: usize,
    /// Job counts.
    pub jobs: JobStats,
    /// Seconds since the server was built.
    pub uptime_secs: u64,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

/// Aggregate server metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMetrics {
    /// Tool registry metrics.
    pub registry: RegistryMetrics,
    /// Job counts.
    pub jobs: JobStats,
    /// Established sessions.
    pub sessions: usize,
    /// Established sessions using legacy shapes.
    pub legacy_sessions: usize,
    /// Cached compiled schemas.
    pub schema_cache_entries: usize,
}

#[derive(Debug, Clone)]
enum SessionSlot {
    Handshaking,
    Established(Session),
}

/// Replaceable collaborators of a [`ProtocolServer`].
pub struct ServerServices {
    /// Handler factories named by tool manifests.
    pub handlers: HandlerTable,
    /// Memory store for the memory tools.
    pub memory: Option<Arc<dyn MemoryStore>>,
    /// Job persistence.
    pub job_store: Arc<dyn JobStore>,
}

impl Default for ServerServices {
    fn default() -> Self {
        Self {
            handlers: HandlerTable::with_builtins(),
            memory: None,
            job_store: Arc::new(InMemoryJobStore::new()),
        }
    }
}

/// The protocol server.
pub struct ProtocolServer {
    server: ServerConfig,
    negotiator: RwLock<VersionNegotiator>,
    adapter: CompatibilityAdapter,
    registry: Arc<ToolRegistry>,
    validator: Arc<SchemaValidator>,
    validation_enabled: bool,
    jobs: JobManager,
    sessions: RwLock<HashMap<String, SessionSlot>>,
    started: Instant,
}

impl ProtocolServer {
    /// Builds a server from configuration and scans the tool directory.
    #[must_use]
    pub fn new(config: &Config, services: ServerServices) -> Self {
        let loader = Arc::new(ToolLoader::new(
            config.tools.directory.clone(),
            Arc::new(services.handlers),
        ));
        let registry = Arc::new(ToolRegistry::new(ToolServices {
            catalog: loader,
            memory: services.memory,
        }));
        registry.initialize();

        let negotiator = VersionNegotiator::new(
            MCP_PROTOCOL_VERSION,
            config.server.supported_versions.iter().cloned(),
            config.server.capabilities.iter().cloned(),
        );

        tracing::info!(
            server_id = %config.server.server_id,
            version = MCP_PROTOCOL_VERSION,
            capabilities = ?config.server.capabilities,
            "Protocol server ready"
        );

        Self {
            server: config.server.clone(),
            negotiator: RwLock::new(negotiator),
            adapter: CompatibilityAdapter::new(MCP_PROTOCOL_VERSION),
            registry,
            validator: Arc::new(SchemaValidator::new(Duration::from_secs(
                config.validation.cache_ttl_secs,
            ))),
            validation_enabled: config.validation.enabled,
            jobs: JobManager::new(services.job_store, config.jobs.clone()),
            sessions: RwLock::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    /// The tool registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The job manager.
    #[must_use]
    pub const fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    /// Registers an always-resident tool.
    pub fn register_tool(&self, tool: Tool) {
        self.registry.register_resident(tool);
    }

    /// Advertises a capability to future handshakes.
    pub fn add_capability(&self, capability: impl Into<String>) -> bool {
        self.negotiator.write().add_capability(capability)
    }

    /// Withdraws a capability from future handshakes.
    pub fn remove_capability(&self, capability: &str) -> bool {
        self.negotiator.write().remove_capability(capability)
    }

    /// Returns an established session.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<Session> {
        match self.sessions.read().get(session_id) {
            Some(SessionSlot::Established(session)) => Some(session.clone()),
            _ => None,
        }
    }

    /// Removes a session. Returns whether it existed.
    pub fn end_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id).is_some();
        if removed {
            tracing::info!(session_id, "Session ended");
        }
        removed
    }

    /// Negotiates a handshake and records the session.
    ///
    /// The returned handshake carries the negotiated version and
    /// capabilities, not the server's full set.
    ///
    /// # Errors
    ///
    /// Returns the failed [`NegotiationResult`] for malformed or incompatible
    /// handshakes, or for a session that is already established.
    pub fn handle_handshake(
        &self,
        session_id: &str,
        handshake: ClientHandshake,
    ) -> Result<ServerHandshake, NegotiationResult> {
        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(session_id) {
                return Err(self
                    .negotiator
                    .read()
                    .reject(format!("Session {session_id} is already established")));
            }
            sessions.insert(session_id.to_string(), SessionSlot::Handshaking);
        }

        let (is_legacy, negotiation) = {
            let negotiator = self.negotiator.read();
            match handshake {
                ClientHandshake::Modern(hs) => (false, (negotiator.negotiate(&hs), hs.client_id)),
                ClientHandshake::Legacy(legacy) => {
                    let hs = self.adapter.convert_to_modern(legacy, self.server.transport);
                    (true, (negotiator.negotiate(&hs), hs.client_id))
                }
                ClientHandshake::Malformed(reason) => (
                    false,
                    (negotiator.reject(format!("Malformed handshake: {reason}")), None),
                ),
            }
        };
        let (result, client_id) = negotiation;

        if !result.success {
            self.sessions.write().remove(session_id);
            tracing::warn!(session_id, error = ?result.error, "Handshake rejected");
            return Err(result);
        }

        let session = Session {
            client_id,
            agreed_version: result.agreed_version.clone(),
            agreed_capabilities: result.agreed_capabilities.clone(),
            is_legacy,
        };
        tracing::info!(
            session_id,
            client_id = ?session.client_id,
            version = %session.agreed_version,
            capabilities = ?session.agreed_capabilities,
            legacy = is_legacy,
            "Session established"
        );
        self.sessions
            .write()
            .insert(session_id.to_string(), SessionSlot::Established(session));

        let mut reply = self.negotiator.read().create_server_handshake(
            self.server.server_id.clone(),
            self.server.transport,
            None,
        );
        reply.mcp_version = result.agreed_version;
        reply.capabilities = result.agreed_capabilities;
        Ok(reply)
    }

    /// Handles a raw handshake and renders the reply, in legacy shape for
    /// legacy clients.
    ///
    /// # Errors
    ///
    /// Returns the failed [`NegotiationResult`].
    pub fn handshake_value(
        &self,
        session_id: &str,
        raw: &Value,
    ) -> Result<Value, NegotiationResult> {
        let handshake = CompatibilityAdapter::classify_handshake(raw);
        let legacy = matches!(handshake, ClientHandshake::Legacy(_));
        let reply = self.handle_handshake(session_id, handshake)?;
        let value = serde_json::to_value(reply).unwrap_or(Value::Null);
        Ok(self.adapter.convert_to_legacy(value, legacy))
    }

    /// Handles a raw tool call and renders the response.
    ///
    /// A legacy-shaped call without a session establishes a legacy session
    /// first. Responses to legacy sessions carry legacy field names.
    pub async fn tool_call_value(&self, session_id: &str, raw: &Value) -> Value {
        let session = match self.session(session_id) {
            Some(session) => session,
            None if CompatibilityAdapter::is_legacy_tool_call(raw) => {
                match self.handle_handshake(session_id, ClientHandshake::Legacy(LegacyHandshake::default())) {
                    Ok(_) => match self.session(session_id) {
                        Some(session) => session,
                        None => return self.no_session_value(raw),
                    },
                    Err(_) => return self.no_session_value(raw),
                }
            }
            None => return self.no_session_value(raw),
        };

        let response = match CompatibilityAdapter::classify_tool_call(raw, session.is_legacy) {
            Ok(call) => self.handle_tool_call(session_id, call).await,
            Err(payload) => ToolCallResponse::failure(raw_request_id(raw), payload),
        };

        let value = serde_json::to_value(response).unwrap_or(Value::Null);
        self.adapter.convert_to_legacy(value, session.is_legacy)
    }

    fn no_session_value(&self, raw: &Value) -> Value {
        let response = ToolCallResponse::failure(raw_request_id(raw), no_session_error());
        serde_json::to_value(response).unwrap_or(Value::Null)
    }

    /// Executes a classified tool call for an established session.
    pub async fn handle_tool_call(&self, session_id: &str, call: ToolCall) -> ToolCallResponse {
        let Some(session) = self.session(session_id) else {
            return ToolCallResponse::failure(call.request_id(), no_session_error());
        };

        match call {
            ToolCall::Legacy(call) => self.legacy_call(session_id, call).await,
            ToolCall::Modern(call) => self.modern_call(session_id, &session, call).await,
        }
    }

    async fn legacy_call(&self, session_id: &str, call: LegacyToolCall) -> ToolCallResponse {
        let Some(name) = call.tool_name else {
            return ToolCallResponse::failure(
                call.request_id,
                ErrorPayload::new("INVALID_REQUEST", "Legacy tool call names no tool"),
            );
        };

        let context = self.registry.context(session_id, None);
        match self
            .registry
            .route_tool_call(&name, call.arguments, context)
            .await
        {
            Ok(exec) => ToolCallResponse::success(call.request_id, exec.result, exec.duration_ms),
            Err(e) => ToolCallResponse::failure(call.request_id, ErrorPayload::from(&e)),
        }
    }

    async fn modern_call(
        &self,
        session_id: &str,
        session: &Session,
        call: ToolCallRequest,
    ) -> ToolCallResponse {
        let ToolCallRequest {
            request_id,
            tool_id,
            arguments,
            mode,
        } = call;

        let Some(tool_id) = tool_id.filter(|t| !t.is_empty()) else {
            return ToolCallResponse::failure(
                request_id,
                ErrorPayload::new("INVALID_REQUEST", "tool_id is required"),
            );
        };

        let tool = match self.registry.resolve(&tool_id) {
            Ok(tool) => tool,
            Err(e) => {
                tracing::warn!(session_id, tool = %tool_id, error = %e, "Tool call rejected");
                return ToolCallResponse::failure(request_id, ErrorPayload::from(&e));
            }
        };

        if self.validation_enabled {
            if let Err(payload) = self.validate_arguments(&tool, &arguments) {
                return ToolCallResponse::failure(request_id, payload);
            }
        }

        if mode == CallMode::Async {
            if session.has_capability(ASYNC_CAPABILITY) {
                return self.submit(session_id, request_id, tool, arguments).await;
            }
            tracing::debug!(session_id, tool = %tool_id, "Async not negotiated, executing synchronously");
        }

        let context = self.registry.context(session_id, None);
        match self.registry.execute(&tool, arguments, context).await {
            Ok(exec) => {
                check_output(&self.validator, &tool, &exec.result);
                ToolCallResponse::success(request_id, exec.result, exec.duration_ms)
            }
            Err(e) => ToolCallResponse::failure(request_id, ErrorPayload::from(&e)),
        }
    }

    fn validate_arguments(&self, tool: &Tool, arguments: &Value) -> Result<(), ErrorPayload> {
        let schema = self
            .validator
            .validate_tool_schema(&tool.input_schema)
            .map_err(|e| {
                ErrorPayload::new(
                    "TOOL_LOAD_FAILED",
                    format!("Tool {} declares an unusable input schema: {e}", tool.name()),
                )
            })?;

        let report = self
            .validator
            .validate_input(&schema, arguments)
            .map_err(|e| ErrorPayload::new("TOOL_LOAD_FAILED", e.to_string()))?;
        if report.valid {
            return Ok(());
        }

        let error = ToolError::InvalidArguments {
            name: tool.name().to_string(),
            errors: report.errors,
        };
        tracing::debug!(tool = tool.name(), error = %error, "Arguments rejected");
        Err(ErrorPayload::from(&error))
    }

    async fn submit(
        &self,
        session_id: &str,
        request_id: String,
        tool: Arc<Tool>,
        arguments: Value,
    ) -> ToolCallResponse {
        let request = JobRequest {
            request_id: request_id.clone(),
            tool_id: tool.name().to_string(),
            arguments,
        };
        let registry = Arc::clone(&self.registry);
        let validator = Arc::clone(&self.validator);
        let session_id = session_id.to_string();

        let submitted = self
            .jobs
            .submit_job(request, move |arguments, progress| async move {
                let context = registry.context(&session_id, Some(progress));
                let exec = registry.execute(&tool, arguments, context).await?;
                check_output(&validator, &tool, &exec.result);
                Ok::<_, ToolError>(exec.result)
            })
            .await;

        match submitted {
            Ok(handle) => ToolCallResponse::in_progress(handle),
            Err(e) => ToolCallResponse::failure(request_id, ErrorPayload::from(&e)),
        }
    }

    /// Job status without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] for unknown ids.
    pub async fn poll_job(&self, job_id: &str) -> Result<JobPoll, JobError> {
        self.jobs.poll_job(job_id).await
    }

    /// Job result, error or progress snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] for unknown ids.
    pub async fn resume_job(&self, job_id: &str) -> Result<JobResume, JobError> {
        self.jobs.resume_job(job_id).await
    }

    /// Cancels a live job.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] for unknown ids.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, JobError> {
        self.jobs.cancel_job(job_id).await
    }

    /// Lists jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, JobError> {
        self.jobs.list_jobs(filter).await
    }

    /// Subscribes to job lifecycle events.
    #[must_use]
    pub fn subscribe_jobs(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.jobs.subscribe()
    }

    /// Searches tools with progressive detail.
    #[must_use]
    pub fn search_tools(&self, query: &SearchQuery) -> Vec<Value> {
        self.registry.search(query)
    }

    /// Collects aggregate metrics.
    ///
    /// # Errors
    ///
    /// Returns a job store error.
    pub async fn metrics(&self) -> Result<ServerMetrics, JobError> {
        let (sessions, legacy_sessions) = self.session_counts();
        Ok(ServerMetrics {
            registry: self.registry.metrics(),
            jobs: self.jobs.stats().await?,
            sessions,
            legacy_sessions,
            schema_cache_entries: self.validator.cache_len(),
        })
    }

    /// Measures an internal round-trip through the registry and job store
    /// and classifies it.
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let tools = self.registry.loader().discovered_count();
        match self.jobs.stats().await {
            Ok(jobs) => {
                let latency = started.elapsed();
                self.health_report(HealthStatus::from_latency(latency), latency, tools, jobs)
            }
            Err(e) => {
                tracing::error!(error = %e, "Job store unavailable during health check");
                self.health_report(HealthStatus::Unhealthy, started.elapsed(), tools, JobStats::default())
            }
        }
    }

    fn health_report(
        &self,
        status: HealthStatus,
        latency: Duration,
        tools: usize,
        jobs: JobStats,
    ) -> HealthReport {
        HealthReport {
            status,
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            sessions: self.session_counts().0,
            tools,
            jobs,
            uptime_secs: self.started.elapsed().as_secs(),
            timestamp: Utc::now(),
        }
    }

    fn session_counts(&self) -> (usize, usize) {
        let sessions = self.sessions.read();
        sessions.values().fold((0, 0), |(all, legacy), slot| match slot {
            SessionSlot::Established(s) => (all + 1, legacy + usize::from(s.is_legacy)),
            SessionSlot::Handshaking => (all, legacy),
        })
    }
}

/// Output validation is advisory: drift is logged, never returned.
fn check_output(validator: &SchemaValidator, tool: &Tool, result: &Value) {
    let Some(schema) = &tool.output_schema else {
        return;
    };
    match validator.validate_output(schema, result) {
        Ok(report) if report.valid => {}
        Ok(report) => {
            tracing::warn!(tool = tool.name(), errors = ?report.errors, "Tool output does not match its schema");
        }
        Err(e) => {
            tracing::warn!(tool = tool.name(), error = %e, "Tool output schema is unusable");
        }
    }
}

fn no_session_error() -> ErrorPayload {
    ErrorPayload::new("NO_SESSION", "No session established; send a handshake first")
}

fn raw_request_id(raw: &Value) -> String {
    ["request_id", "id"]
        .iter()
        .find_map(|k| match raw.get(*k) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}
