//! JSON-RPC front end over a line transport.
//!
//! One connection is one session. The server lifecycle is:
//!
//! 1. **Handshake**: `initialize` (or `handshake`) negotiates a version and
//!    capabilities. Legacy clients may skip it and call a tool directly.
//! 2. **Operation**: tool calls, job management, search and health.
//! 3. **Shutdown**: EOF or a termination signal ends the session.
//!
//! Job lifecycle events are forwarded as `notifications/job` while the
//! connection is open.

use std::future::Future;
use std::io;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader, Stdin, Stdout};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::ErrorPayload;
use crate::jobs::{JobEvent, JobFilter};
use crate::mcp::negotiation::NegotiationResult;
use crate::mcp::orchestrator::ProtocolServer;
use crate::mcp::protocol::{
    parse_message, ErrorCode, IncomingMessage, JsonRpcError, JsonRpcErrorData,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, OutgoingNotification, RequestId,
};
use crate::mcp::transport::LineTransport;
use crate::tools::SearchQuery;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// No session yet.
    AwaitingHandshake,
    /// A session is established.
    Running,
    /// Shutdown in progress.
    ShuttingDown,
}

enum Input {
    Line(io::Result<Option<String>>),
    Event(Result<JobEvent, RecvError>),
}

#[derive(Debug, Deserialize)]
struct JobParams {
    #[serde(alias = "jobId")]
    job_id: String,
}

/// Serves one JSON-RPC connection against a shared [`ProtocolServer`].
pub struct McpServer<R = BufReader<Stdin>, W = Stdout> {
    state: ServerState,
    transport: LineTransport<R, W>,
    server: Arc<ProtocolServer>,
    session_id: String,
    events: broadcast::Receiver<JobEvent>,
    forward_events: bool,
}

impl McpServer {
    /// Creates a server over the process's stdin and stdout.
    #[must_use]
    pub fn stdio(server: Arc<ProtocolServer>) -> Self {
        Self::new(server, LineTransport::stdio())
    }
}

impl<R, W> McpServer<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a server over an arbitrary transport with a fresh session id.
    #[must_use]
    pub fn new(server: Arc<ProtocolServer>, transport: LineTransport<R, W>) -> Self {
        let events = server.subscribe_jobs();
        Self {
            state: ServerState::AwaitingHandshake,
            transport,
            server,
            session_id: uuid::Uuid::new_v4().to_string(),
            events,
            forward_events: true,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> ServerState {
        self.state
    }

    /// Session id used for this connection.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Consumes the server and returns its transport.
    pub fn into_transport(self) -> LineTransport<R, W> {
        self.transport
    }

    /// Runs until EOF or a termination signal.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed or transport
    /// I/O fails.
    #[cfg(unix)]
    pub async fn run(&mut self) -> io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(io::Error::other)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(io::Error::other)?;

        self.serve_until(async move {
            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }

                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
            }
        })
        .await
    }

    /// Runs until EOF or Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns an error if transport I/O fails.
    #[cfg(windows)]
    pub async fn run(&mut self) -> io::Result<()> {
        self.serve_until(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            }
        })
        .await
    }

    /// Runs until EOF without installing signal handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if transport I/O fails.
    pub async fn serve(&mut self) -> io::Result<()> {
        self.serve_until(std::future::pending::<()>()).await
    }

    /// Runs until EOF or until `shutdown` resolves.
    ///
    /// `shutdown` only races the wait for the next line or job event. A
    /// request that has been read is always answered before the loop exits.
    ///
    /// # Errors
    ///
    /// Returns an error if transport I/O fails.
    pub async fn serve_until<F>(&mut self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                () = &mut shutdown => break Ok(()),

                input = self.next_input() => {
                    match self.dispatch(input).await {
                        Ok(false) => {}
                        Ok(true) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        self.finish();
        result
    }

    /// Waits for the next input line or job event. Cancellation safe.
    async fn next_input(&mut self) -> Input {
        tokio::select! {
            line = self.transport.read_line() => Input::Line(line),
            event = self.events.recv(), if self.forward_events => Input::Event(event),
        }
    }

    /// Handles one input. Returns `true` at EOF.
    async fn dispatch(&mut self, input: Input) -> io::Result<bool> {
        match input {
            Input::Line(line) => {
                let Some(line) = line? else {
                    return Ok(true);
                };
                if !line.trim().is_empty() {
                    self.handle_line(&line).await?;
                }
                Ok(false)
            }
            Input::Event(event) => {
                self.forward_event(event).await?;
                Ok(false)
            }
        }
    }

    fn finish(&mut self) {
        self.state = ServerState::ShuttingDown;
        if self.server.end_session(&self.session_id) {
            tracing::info!(session = %self.session_id, "Session closed");
        }
    }

    async fn forward_event(&mut self, event: Result<JobEvent, RecvError>) -> io::Result<()> {
        match event {
            Ok(event) => {
                let params = serde_json::to_value(&event).unwrap_or(Value::Null);
                self.transport
                    .write_message(&OutgoingNotification::job_event(params))
                    .await
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Job event stream lagged; notifications dropped");
                Ok(())
            }
            Err(RecvError::Closed) => {
                self.forward_events = false;
                Ok(())
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> io::Result<()> {
        match parse_message(line) {
            Ok(IncomingMessage::Request(req)) => self.handle_request(req).await,
            Ok(IncomingMessage::Notification(notif)) => {
                self.handle_notification(&notif);
                Ok(())
            }
            Err(error) => self.transport.write_message(&error).await,
        }
    }

    async fn handle_request(&mut self, req: JsonRpcRequest) -> io::Result<()> {
        tracing::debug!(method = %req.method, "Handling request");

        let result = match req.method.as_str() {
            "initialize" | "handshake" => self.handle_handshake(&req),
            "tools/list" => self.handle_tools_list(&req),
            "tools/search" => self.handle_tools_search(&req),
            "tools/call" => self.handle_tools_call(&req).await,
            "jobs/poll" => self.handle_jobs_poll(&req).await,
            "jobs/resume" => self.handle_jobs_resume(&req).await,
            "jobs/cancel" => self.handle_jobs_cancel(&req).await,
            "jobs/list" => self.handle_jobs_list(&req).await,
            "health" => Ok(to_value(&self.server.health_check().await)),
            "metrics" => self.handle_metrics(&req).await,
            "ping" => Ok(json!({})),
            _ => Err(JsonRpcError::method_not_found(req.id.clone(), &req.method)),
        };

        match result {
            Ok(value) => {
                self.transport
                    .write_message(&JsonRpcResponse::success(req.id, value))
                    .await
            }
            Err(error) => self.transport.write_message(&error).await,
        }
    }

    fn handle_notification(&self, notif: &JsonRpcNotification) {
        match notif.method.as_str() {
            "notifications/initialized" => {
                tracing::debug!(session = %self.session_id, "Client initialised");
            }
            other => tracing::debug!(method = other, "Ignoring notification"),
        }
    }

    fn handle_handshake(&mut self, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let params = req.params.clone().unwrap_or_else(|| json!({}));
        match self.server.handshake_value(&self.session_id, &params) {
            Ok(reply) => {
                self.state = ServerState::Running;
                Ok(reply)
            }
            Err(result) => Err(negotiation_error(req.id.clone(), &result)),
        }
    }

    fn handle_tools_list(&self, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let listing: SearchQuery = optional_params(req)?;
        let query = SearchQuery {
            detail_level: listing.detail_level,
            ..SearchQuery::default()
        };
        Ok(tool_listing(self.server.search_tools(&query)))
    }

    fn handle_tools_search(&self, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let query: SearchQuery = optional_params(req)?;
        Ok(tool_listing(self.server.search_tools(&query)))
    }

    async fn handle_tools_call(&mut self, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let params = req
            .params
            .as_ref()
            .ok_or_else(|| JsonRpcError::invalid_params(req.id.clone(), "Missing tool call params"))?;

        let response = self.server.tool_call_value(&self.session_id, params).await;
        if self.state == ServerState::AwaitingHandshake && self.server.session(&self.session_id).is_some() {
            self.state = ServerState::Running;
        }
        Ok(response)
    }

    async fn handle_jobs_poll(&self, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let params: JobParams = self.job_params(req)?;
        self.server
            .poll_job(&params.job_id)
            .await
            .map(|poll| to_value(&poll))
            .map_err(|e| JsonRpcError::from_payload(req.id.clone(), &ErrorPayload::from(&e)))
    }

    async fn handle_jobs_resume(&self, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let params: JobParams = self.job_params(req)?;
        self.server
            .resume_job(&params.job_id)
            .await
            .map(|resume| to_value(&resume))
            .map_err(|e| JsonRpcError::from_payload(req.id.clone(), &ErrorPayload::from(&e)))
    }

    async fn handle_jobs_cancel(&self, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let params: JobParams = self.job_params(req)?;
        let cancelled = self
            .server
            .cancel_job(&params.job_id)
            .await
            .map_err(|e| JsonRpcError::from_payload(req.id.clone(), &ErrorPayload::from(&e)))?;
        Ok(json!({ "job_id": params.job_id, "cancelled": cancelled }))
    }

    async fn handle_jobs_list(&self, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        self.require_session(&req.id)?;
        let filter: JobFilter = optional_params(req)?;
        let jobs = self
            .server
            .list_jobs(filter)
            .await
            .map_err(|e| JsonRpcError::from_payload(req.id.clone(), &ErrorPayload::from(&e)))?;
        Ok(json!({ "count": jobs.len(), "jobs": jobs }))
    }

    async fn handle_metrics(&self, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        self.server
            .metrics()
            .await
            .map(|metrics| to_value(&metrics))
            .map_err(|e| JsonRpcError::from_payload(req.id.clone(), &ErrorPayload::from(&e)))
    }

    fn job_params(&self, req: &JsonRpcRequest) -> Result<JobParams, JsonRpcError> {
        self.require_session(&req.id)?;
        let params = req
            .params
            .clone()
            .ok_or_else(|| JsonRpcError::invalid_params(req.id.clone(), "Missing job_id"))?;
        serde_json::from_value(params)
            .map_err(|e| JsonRpcError::invalid_params(req.id.clone(), format!("Invalid job params: {e}")))
    }

    fn require_session(&self, id: &RequestId) -> Result<(), JsonRpcError> {
        if self.server.session(&self.session_id).is_none() {
            return Err(JsonRpcError::new(
                Some(id.clone()),
                JsonRpcErrorData::with_message(
                    ErrorCode::NoSession,
                    "No session established; send a handshake first",
                ),
            ));
        }
        Ok(())
    }
}

fn optional_params<T: DeserializeOwned + Default>(req: &JsonRpcRequest) -> Result<T, JsonRpcError> {
    match &req.params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(params) => serde_json::from_value(params.clone())
            .map_err(|e| JsonRpcError::invalid_params(req.id.clone(), format!("Invalid params: {e}"))),
    }
}

fn tool_listing(tools: Vec<Value>) -> Value {
    json!({ "count": tools.len(), "tools": tools })
}

fn negotiation_error(id: RequestId, result: &NegotiationResult) -> JsonRpcError {
    let message = result
        .error
        .clone()
        .unwrap_or_else(|| ErrorCode::NegotiationFailed.default_message().to_string());
    JsonRpcError::new(
        Some(id),
        JsonRpcErrorData::with_message(ErrorCode::NegotiationFailed, message)
            .with_data(to_value(result)),
    )
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to serialise response");
        Value::Null
    })
}
