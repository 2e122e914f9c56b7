//! The async job manager.
//!
//! Submission is the only synchronous interaction: it checks capacity,
//! persists a queued record and spawns the executor. Every later state
//! change goes through [`Inner::update`], which serialises load-modify-save
//! cycles so a late executor result can never overwrite a cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use super::{
    InMemoryJobStore, Job, JobEvent, JobFilter, JobHandle, JobPoll, JobRequest, JobResume,
    JobStats, JobStatus, JobStore,
};
use crate::config::JobsConfig;
use crate::error::{ErrorPayload, JobError, ToolError};

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct Inner {
    store: Arc<dyn JobStore>,
    config: JobsConfig,
    submit_lock: Mutex<()>,
    transition_lock: Mutex<()>,
    events: broadcast::Sender<JobEvent>,
}

impl Inner {
    /// Applies `change` to a job under the transition lock. The job is saved
    /// only when `change` returns `true`; the updated job is returned then.
    async fn update<F>(&self, job_id: &str, change: F) -> Result<Option<Job>, JobError>
    where
        F: FnOnce(&mut Job) -> bool + Send,
    {
        let _guard = self.transition_lock.lock().await;
        let mut job = self
            .store
            .load(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if !change(&mut job) {
            return Ok(None);
        }
        self.store.save(&job).await?;
        Ok(Some(job))
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn run<F, Fut>(self: Arc<Self>, job_id: String, executor: F)
    where
        F: FnOnce(Value, ProgressReporter) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let started = self
            .update(&job_id, |job| {
                if job.status != JobStatus::Queued {
                    return false;
                }
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                true
            })
            .await;

        let arguments = match started {
            Ok(Some(job)) => job.arguments,
            Ok(None) => {
                tracing::debug!(job_id = %job_id, "Job cancelled before it started");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to start job");
                return;
            }
        };
        self.emit(JobEvent::Started {
            job_id: job_id.clone(),
        });

        let reporter = ProgressReporter {
            inner: Arc::clone(&self),
            job_id: job_id.clone(),
        };

        // Run in a nested task so a panicking executor fails the job instead
        // of leaving it running forever.
        let outcome = match tokio::spawn(executor(arguments, reporter)).await {
            Ok(outcome) => outcome,
            Err(e) => Err(ToolError::execution(format!("executor aborted: {e}"))),
        };

        match outcome {
            Ok(result) => {
                let applied = self
                    .update(&job_id, move |job| {
                        if job.status != JobStatus::Running {
                            return false;
                        }
                        job.status = JobStatus::Success;
                        job.result = Some(result);
                        job.progress = 100.0;
                        job.completed_at = Some(Utc::now());
                        true
                    })
                    .await;
                self.finish(&job_id, applied, JobEvent::Completed {
                    job_id: job_id.clone(),
                });
            }
            Err(error) => {
                tracing::warn!(job_id = %job_id, error = %error, "Job executor failed");
                let message = error.to_string();
                let payload = ErrorPayload::from(&error);
                let applied = self
                    .update(&job_id, move |job| {
                        if job.status != JobStatus::Running {
                            return false;
                        }
                        job.status = JobStatus::Error;
                        job.error = Some(payload);
                        job.completed_at = Some(Utc::now());
                        true
                    })
                    .await;
                self.finish(&job_id, applied, JobEvent::Failed {
                    job_id: job_id.clone(),
                    message,
                });
            }
        }
    }

    fn finish(&self, job_id: &str, applied: Result<Option<Job>, JobError>, event: JobEvent) {
        match applied {
            Ok(Some(job)) => {
                tracing::info!(job_id, status = ?job.status, duration_ms = ?job.duration_ms(), "Job finished");
                self.emit(event);
            }
            Ok(None) => {
                tracing::debug!(job_id, "Job already terminal, discarding executor outcome");
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to persist job outcome");
            }
        }
    }

    async fn sweep_expired(&self) -> Result<usize, JobError> {
        let ttl = Duration::from_secs(self.config.ttl_secs);
        let now = Utc::now();

        let _guard = self.transition_lock.lock().await;
        let jobs = self.store.list(&JobFilter::default()).await?;
        let mut removed = 0;
        for job in jobs {
            let age = (now - job.created_at).to_std().unwrap_or_default();
            if job.status == JobStatus::Running || age <= ttl {
                continue;
            }
            if self.store.delete(&job.job_id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Progress callback handed to a job executor.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<Inner>,
    job_id: String,
}

impl ProgressReporter {
    /// Records progress. `percent` is clamped to `[0, 100]`. Persistence
    /// failures are logged, never returned; updates to a job that is no
    /// longer running are ignored.
    pub async fn report(&self, percent: f64, message: impl Into<String> + Send) {
        let percent = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };
        let message = message.into();
        let message = (!message.is_empty()).then_some(message);

        let update_message = message.clone();
        let applied = self
            .inner
            .update(&self.job_id, move |job| {
                if job.status != JobStatus::Running {
                    return false;
                }
                job.progress = percent;
                job.progress_message = update_message;
                true
            })
            .await;

        match applied {
            Ok(Some(_)) => self.inner.emit(JobEvent::Progress {
                job_id: self.job_id.clone(),
                progress: percent,
                message,
            }),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Failed to persist job progress");
            }
        }
    }
}

/// Handle for the background TTL sweep.
pub struct SweeperHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stops the sweep loop and waits for it to exit.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Job sweeper task ended abnormally");
            }
        }
        tracing::info!("Job sweeper stopped");
    }

    /// Whether the sweep loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Runs tool invocations as durable, pollable jobs.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    /// Creates a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, config: JobsConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                submit_lock: Mutex::new(()),
                transition_lock: Mutex::new(()),
                events,
            }),
        }
    }

    /// Creates a manager with the default in-memory store.
    #[must_use]
    pub fn in_memory(config: JobsConfig) -> Self {
        Self::new(Arc::new(InMemoryJobStore::new()), config)
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Accepts a job and starts it in the background.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::CapacityExceeded`] when the number of queued and
    /// running jobs has reached `max_jobs`, or a store error.
    pub async fn submit_job<F, Fut>(
        &self,
        request: JobRequest,
        executor: F,
    ) -> Result<JobHandle, JobError>
    where
        F: FnOnce(Value, ProgressReporter) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let job = {
            let _guard = self.inner.submit_lock.lock().await;

            let live = self.stats().await?.live();
            if live >= self.inner.config.max_jobs {
                tracing::warn!(live, max = self.inner.config.max_jobs, "Job capacity exceeded");
                return Err(JobError::CapacityExceeded {
                    live,
                    max: self.inner.config.max_jobs,
                });
            }

            let job = Job::new(request);
            self.inner.store.save(&job).await?;
            job
        };

        tracing::info!(job_id = %job.job_id, tool = %job.tool_id, "Job queued");
        self.inner.emit(JobEvent::Queued {
            job_id: job.job_id.clone(),
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.run(job.job_id.clone(), executor));

        Ok(JobHandle {
            request_id: job.request_id,
            job_id: job.job_id,
            status: "in_progress",
            poll_after: self.inner.config.poll_after_secs,
        })
    }

    /// Returns the current status without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] for unknown ids.
    pub async fn poll_job(&self, job_id: &str) -> Result<JobPoll, JobError> {
        let job = self.load(job_id).await?;
        Ok(JobPoll {
            poll_after: if job.status.is_terminal() {
                0
            } else {
                self.inner.config.poll_after_secs
            },
            job_id: job.job_id,
            request_id: job.request_id,
            tool_id: job.tool_id,
            status: job.status,
            progress: job.progress,
            progress_message: job.progress_message,
        })
    }

    /// Returns the result, error or progress snapshot of a job.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] for unknown ids.
    pub async fn resume_job(&self, job_id: &str) -> Result<JobResume, JobError> {
        let job = self.load(job_id).await?;
        let duration_ms = job.duration_ms();
        Ok(JobResume {
            job_id: job.job_id,
            request_id: job.request_id,
            status: job.status,
            result: if job.status == JobStatus::Success {
                job.result
            } else {
                None
            },
            error: if job.status == JobStatus::Error {
                job.error
            } else {
                None
            },
            progress: job.progress,
            progress_message: job.progress_message,
            duration_ms,
        })
    }

    /// Cancels a queued or running job. Returns whether it took effect.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] for unknown ids.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, JobError> {
        let cancelled = self
            .inner
            .update(job_id, |job| {
                if job.status.is_terminal() {
                    return false;
                }
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                true
            })
            .await?;

        if cancelled.is_some() {
            tracing::info!(job_id, "Job cancelled");
            self.inner.emit(JobEvent::Cancelled {
                job_id: job_id.to_string(),
            });
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Lists jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, JobError> {
        self.inner.store.list(&filter).await
    }

    /// Counts jobs by state.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn stats(&self) -> Result<JobStats, JobError> {
        let jobs = self.inner.store.list(&JobFilter::default()).await?;
        let mut stats = JobStats::default();
        for job in &jobs {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Success => stats.success += 1,
                JobStatus::Error => stats.error += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    /// Removes jobs older than the TTL that are not running.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn sweep_expired(&self) -> Result<usize, JobError> {
        self.inner.sweep_expired().await
    }

    /// Spawns the periodic TTL sweep.
    #[must_use]
    pub fn start_sweeper(&self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let inner = Arc::clone(&self.inner);
        let period = Duration::from_secs(self.inner.config.sweep_interval_secs.max(1));

        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            // The first tick completes immediately.
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        match inner.sweep_expired().await {
                            Ok(0) => {}
                            Ok(removed) => tracing::debug!(removed, "Swept expired jobs"),
                            Err(e) => tracing::error!(error = %e, "Job sweep failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        SweeperHandle {
            shutdown_tx,
            task: Some(task),
        }
    }

    async fn load(&self, job_id: &str) -> Result<Job, JobError> {
        self.inner
            .store
            .load(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn config(max_jobs: usize) -> JobsConfig {
        JobsConfig {
            max_jobs,
            ttl_secs: 3600,
            sweep_interval_secs: 60,
            poll_after_secs: 2,
        }
    }

    fn request(tool: &str) -> JobRequest {
        JobRequest {
            request_id: format!("req-{tool}"),
            tool_id: tool.to_string(),
            arguments: json!({"n": 2}),
        }
    }

    async fn wait_for(manager: &JobManager, job_id: &str, status: JobStatus) -> JobPoll {
        for _ in 0..200 {
            let poll = manager.poll_job(job_id).await.unwrap();
            if poll.status == status {
                return poll;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached {status:?}");
    }

    #[tokio::test]
    async fn successful_job_reaches_success() {
        let manager = JobManager::in_memory(config(4));
        let handle = manager
            .submit_job(request("double"), |args, _progress| async move {
                Ok(json!({"result": args["n"].as_i64().unwrap_or(0) * 2}))
            })
            .await
            .unwrap();
        assert_eq!(handle.status, "in_progress");
        assert_eq!(handle.poll_after, 2);

        let poll = wait_for(&manager, &handle.job_id, JobStatus::Success).await;
        assert_eq!(poll.poll_after, 0);
        assert!((poll.progress - 100.0).abs() < f64::EPSILON);

        let resume = manager.resume_job(&handle.job_id).await.unwrap();
        assert_eq!(resume.result, Some(json!({"result": 4})));
        assert!(resume.error.is_none());
        assert!(resume.duration_ms.is_some());
    }

    #[tokio::test]
    async fn failing_job_reaches_error() {
        let manager = JobManager::in_memory(config(4));
        let handle = manager
            .submit_job(request("boom"), |_args, _progress| async move {
                Err(ToolError::execution("boom"))
            })
            .await
            .unwrap();

        wait_for(&manager, &handle.job_id, JobStatus::Error).await;
        let resume = manager.resume_job(&handle.job_id).await.unwrap();
        assert!(resume.result.is_none());
        let error = resume.error.unwrap();
        assert_eq!(error.code, "EXECUTION_FAILED");
        assert_eq!(error.message, "boom");
    }

    #[tokio::test]
    async fn capacity_is_enforced_without_mutation() {
        let manager = JobManager::in_memory(config(1));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let first = manager
            .submit_job(request("slow"), |_args, _p| async move {
                let _ = release_rx.await;
                Ok(json!(null))
            })
            .await
            .unwrap();

        let before = manager.list_jobs(JobFilter::default()).await.unwrap();
        let err = manager
            .submit_job(request("second"), |_args, _p| async move { Ok(json!(null)) })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::CapacityExceeded { live: 1, max: 1 }));
        let after = manager.list_jobs(JobFilter::default()).await.unwrap();
        assert_eq!(before.len(), after.len());

        release_tx.send(()).unwrap();
        wait_for(&manager, &first.job_id, JobStatus::Success).await;
        assert!(manager
            .submit_job(request("third"), |_args, _p| async move { Ok(json!(null)) })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn progress_is_clamped_and_persisted() {
        let manager = JobManager::in_memory(config(4));
        let (reported_tx, reported_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let handle = manager
            .submit_job(request("progress"), |_args, progress| async move {
                progress.report(250.0, "almost").await;
                let _ = reported_tx.send(());
                let _ = release_rx.await;
                Ok(json!("done"))
            })
            .await
            .unwrap();

        reported_rx.await.unwrap();
        let poll = manager.poll_job(&handle.job_id).await.unwrap();
        assert_eq!(poll.status, JobStatus::Running);
        assert!((poll.progress - 100.0).abs() < f64::EPSILON);
        assert_eq!(poll.progress_message.as_deref(), Some("almost"));
        assert_eq!(poll.poll_after, 2);

        let snapshot = manager.resume_job(&handle.job_id).await.unwrap();
        assert!(snapshot.result.is_none());

        release_tx.send(()).unwrap();
        wait_for(&manager, &handle.job_id, JobStatus::Success).await;
    }

    #[tokio::test]
    async fn cancel_running_job_discards_late_result() {
        let manager = JobManager::in_memory(config(4));
        let mut events = manager.subscribe();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let handle = manager
            .submit_job(request("slow"), |_args, _p| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(json!("late"))
            })
            .await
            .unwrap();

        started_rx.await.unwrap();
        assert!(manager.cancel_job(&handle.job_id).await.unwrap());
        let cancelled_at = manager.list_jobs(JobFilter::default()).await.unwrap()[0].completed_at;

        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let job = &manager.list_jobs(JobFilter::default()).await.unwrap()[0];
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());
        assert_eq!(job.completed_at, cancelled_at);

        let mut terminal = 0;
        while let Ok(event) = events.try_recv() {
            if event.is_terminal() {
                terminal += 1;
            }
        }
        assert_eq!(terminal, 1);
    }

    #[tokio::test]
    async fn cancel_terminal_job_is_a_no_op() {
        let manager = JobManager::in_memory(config(4));
        let handle = manager
            .submit_job(request("fast"), |_a, _p| async move { Ok(json!(1)) })
            .await
            .unwrap();
        wait_for(&manager, &handle.job_id, JobStatus::Success).await;
        let before = manager.list_jobs(JobFilter::default()).await.unwrap()[0].completed_at;

        assert!(!manager.cancel_job(&handle.job_id).await.unwrap());
        let after = manager.list_jobs(JobFilter::default()).await.unwrap()[0].completed_at;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let manager = JobManager::in_memory(config(4));
        let err = manager.poll_job("nope").await.unwrap_err();
        assert_eq!(err.to_string(), "Job not found: nope");
        assert!(manager.resume_job("nope").await.is_err());
        assert!(manager.cancel_job("nope").await.is_err());
    }

    #[tokio::test]
    async fn panicking_executor_fails_the_job() {
        let manager = JobManager::in_memory(config(4));
        let handle = manager
            .submit_job(request("panic"), |_a, _p| async move {
                if true {
                    panic!("executor bug");
                }
                Ok(json!(null))
            })
            .await
            .unwrap();
        wait_for(&manager, &handle.job_id, JobStatus::Error).await;
    }

    #[tokio::test]
    async fn sweep_removes_expired_non_running_jobs() {
        let mut cfg = config(4);
        cfg.ttl_secs = 0;
        let manager = JobManager::in_memory(cfg);

        let done = manager
            .submit_job(request("done"), |_a, _p| async move { Ok(json!(1)) })
            .await
            .unwrap();
        wait_for(&manager, &done.job_id, JobStatus::Success).await;

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let running = manager
            .submit_job(request("running"), |_a, _p| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(json!(2))
            })
            .await
            .unwrap();
        started_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(manager.sweep_expired().await.unwrap(), 1);
        assert!(manager.poll_job(&done.job_id).await.is_err());
        assert!(manager.poll_job(&running.job_id).await.is_ok());

        release_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn sweeper_can_be_stopped() {
        let manager = JobManager::in_memory(config(4));
        let mut sweeper = manager.start_sweeper();
        assert!(sweeper.is_running());
        sweeper.stop().await;
        assert!(!sweeper.is_running());
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let manager = JobManager::in_memory(config(4));
        let mut events = manager.subscribe();
        let handle = manager
            .submit_job(request("evt"), |_a, p| async move {
                p.report(50.0, "half").await;
                Ok(json!(1))
            })
            .await
            .unwrap();
        wait_for(&manager, &handle.job_id, JobStatus::Success).await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.job_id(), handle.job_id);
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(JobEvent::Queued { .. })));
        assert!(seen.iter().any(|e| matches!(e, JobEvent::Progress { .. })));
        assert!(matches!(seen.last(), Some(JobEvent::Completed { .. })));
    }
}
