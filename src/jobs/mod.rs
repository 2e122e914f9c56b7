//! Asynchronous job execution.
//!
//! A tool call submitted in async mode becomes a [`Job`]: a durable record
//! with its own lifecycle, independent of the request that created it.
//!
//! ```text
//!   queued ──▶ running ──▶ success
//!     │           │   └──▶ error
//!     └───────────┴──────▶ cancelled
//! ```
//!
//! Cancellation is cooperative. It marks the record terminal but does not
//! interrupt an executor that is already running, so side effects of a
//! cancelled job may still complete after `cancel_job` returns. A result
//! arriving after cancellation is discarded.

mod manager;
mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorPayload;

pub use manager::{JobManager, ProgressReporter, SweeperHandle};
pub use store::{InMemoryJobStore, JobStore};

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, not started.
    Queued,
    /// Executor running.
    Running,
    /// Finished with a result.
    Success,
    /// Finished with an error.
    Error,
    /// Cancelled before finishing.
    Cancelled,
}

impl JobStatus {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

/// A durable record of one asynchronous tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Server-generated unique id.
    pub job_id: String,
    /// Id of the tool-call request that created the job.
    pub request_id: String,
    /// Tool being executed.
    pub tool_id: String,
    /// Arguments passed to the tool.
    pub arguments: Value,
    /// Current state.
    pub status: JobStatus,
    /// Completion percentage in `[0, 100]`.
    pub progress: f64,
    /// Latest progress message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    /// Result, once successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error, once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
    /// When the executor started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a queued job for `request`.
    #[must_use]
    pub fn new(request: JobRequest) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            request_id: request.request_id,
            tool_id: request.tool_id,
            arguments: request.arguments,
            status: JobStatus::Queued,
            progress: 0.0,
            progress_message: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Elapsed execution time, if the job has started.
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        u64::try_from((end - started).num_milliseconds()).ok()
    }
}

/// What to run as a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    /// Originating request id.
    pub request_id: String,
    /// Tool to execute.
    pub tool_id: String,
    /// Tool arguments.
    pub arguments: Value,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct JobFilter {
    /// Only jobs in this state.
    #[serde(default)]
    pub status: Option<JobStatus>,
    /// Maximum number of jobs returned (newest first).
    #[serde(default)]
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Whether `job` passes the status filter.
    #[must_use]
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| s == job.status)
    }
}

/// Handle returned immediately by a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    /// Originating request id.
    pub request_id: String,
    /// Id to poll, resume or cancel.
    pub job_id: String,
    /// Always `"in_progress"`.
    pub status: &'static str,
    /// Seconds to wait before the first poll.
    pub poll_after: u64,
}

/// Side-effect-free status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPoll {
    /// Job id.
    pub job_id: String,
    /// Originating request id.
    pub request_id: String,
    /// Tool being executed.
    pub tool_id: String,
    /// Current state.
    pub status: JobStatus,
    /// Completion percentage.
    pub progress: f64,
    /// Latest progress message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    /// Seconds until the next poll; zero once terminal.
    pub poll_after: u64,
}

/// Result, error or progress snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResume {
    /// Job id.
    pub job_id: String,
    /// Originating request id.
    pub request_id: String,
    /// Current state.
    pub status: JobStatus,
    /// Result for successful jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Structured error for failed jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// Completion percentage.
    pub progress: f64,
    /// Latest progress message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    /// Execution time so far, or total once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    /// Queued jobs.
    pub queued: usize,
    /// Running jobs.
    pub running: usize,
    /// Successful jobs not yet swept.
    pub success: usize,
    /// Failed jobs not yet swept.
    pub error: usize,
    /// Cancelled jobs not yet swept.
    pub cancelled: usize,
}

impl JobStats {
    /// Queued plus running.
    #[must_use]
    pub const fn live(&self) -> usize {
        self.queued + self.running
    }
}

/// Lifecycle notification. At most one terminal event is sent per job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Accepted.
    Queued {
        /// Job id.
        job_id: String,
    },
    /// Executor started.
    Started {
        /// Job id.
        job_id: String,
    },
    /// Progress reported.
    Progress {
        /// Job id.
        job_id: String,
        /// Completion percentage.
        progress: f64,
        /// Optional message.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Finished successfully.
    Completed {
        /// Job id.
        job_id: String,
    },
    /// Finished with an error.
    Failed {
        /// Job id.
        job_id: String,
        /// Error message.
        message: String,
    },
    /// Cancelled.
    Cancelled {
        /// Job id.
        job_id: String,
    },
}

impl JobEvent {
    /// The job this event belongs to.
    #[must_use]
    pub fn job_id(&self) -> &str {
        match self {
            Self::Queued { job_id }
            | Self::Started { job_id }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id } => job_id,
        }
    }

    /// Whether this event ends the job's lifecycle.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}
