//! Remote jobs.
//!
//! A `Job` binds a host to a `TaskHandler`. The job owns the lifecycle; the handler owns every
//! detail of talking to the remote side, so new backends only need a new handler.
//!
//! ```text
//! PENDING ──process──> RUNNING ──> SUCCEED | FAILED | CANCELLED
//!    └──────────────cancel───────────────────────────^
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::RemoteError;
use crate::host::Host;
use crate::pool::ConnectionPool;
use crate::session::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeed => "SUCCEED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// What a handler observed during one `process` call.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// Nothing changed.
    Idle,
    /// Fraction done, clamped to `[0, 1]`. Non-finite values are ignored.
    Progress(f64),
    Succeeded,
    Failed { message: String },
}

/// Owner of the pending-work agenda. `Job::process` hands failed rounds back through it.
pub trait Dispatcher: Send + Sync {
    fn enqueue(&self, uid: &str, event: &str);
}

/// Everything a handler gets for one round.
pub struct HandlerContext<'a> {
    pub dispatcher: &'a dyn Dispatcher,
    pub uid: &'a str,
    pub event: &'a str,
    pub client: Arc<dyn Connection>,
    /// The job's free-form details. Whatever the handler stores here is persisted with the job.
    pub details: &'a mut Map<String, Value>,
}

/// Drives one kind of remote workload.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Name the handler is persisted under.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: HandlerContext<'_>) -> Result<JobUpdate, RemoteError>;
}

/// Handlers by name, used to rebind restored jobs.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.insert(handler.name().to_string(), handler)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }
}

/// Bounds re-enqueueing after transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed wait before re-enqueueing.
    pub delay: Duration,
    /// Consecutive transport failures that are re-enqueued before one is treated as fatal.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            max_retries: 5,
        }
    }
}

/// Outcome of one `Job::process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// The handler ran and its update was applied.
    Handled,
    /// A transport failure was handed back to the dispatcher.
    Requeued,
    /// The job was already finished.
    Skipped,
}

/// Transport-safe form of a `Job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub uid: String,
    pub name: String,
    pub host: Host,
    pub handler: String,
    pub status: JobStatus,
    pub progress: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure: Option<String>,
    pub traceback: Option<String>,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub attempts: u32,
}

pub struct Job {
    uid: String,
    pub name: String,
    host: Host,
    handler: Arc<dyn TaskHandler>,
    status: JobStatus,
    progress: f64,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    failure: Option<String>,
    traceback: Option<String>,
    pub details: Map<String, Value>,
    attempts: u32,
    retry_policy: RetryPolicy,
}

impl Job {
    pub fn new(name: impl Into<String>, host: Host, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            name: name.into(),
            host,
            handler,
            status: JobStatus::Pending,
            progress: 0.0,
            start_time: None,
            end_time: None,
            failure: None,
            traceback: None,
            details: Map::new(),
            attempts: 0,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn traceback(&self) -> Option<&str> {
        self.traceback.as_deref()
    }

    /// Consecutive transport failures so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Zero before the job starts, running time while it runs, total time once finished.
    pub fn elapsed_time(&self) -> Duration {
        let Some(start) = self.start_time else {
            return Duration::ZERO;
        };
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - start).to_std().unwrap_or_default()
    }

    /// Runs one round of the handler for `event`.
    ///
    /// Transport failures (network or protocol) evict the pooled connection. With `retry` they
    /// are handed back to `dispatcher` after `RetryPolicy::delay`, once per call, until
    /// `RetryPolicy::max_retries` consecutive failures have been requeued. Every other failure
    /// is returned; recording it with `mark_failed` is up to the caller.
    pub async fn process(
        &mut self,
        event: &str,
        dispatcher: &dyn Dispatcher,
        pool: &ConnectionPool,
        retry: bool,
    ) -> Result<Processed, RemoteError> {
        if self.status.is_terminal() {
            debug!(uid = %self.uid, status = %self.status, event, "job already finished");
            return Ok(Processed::Skipped);
        }
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Running;
            self.start_time = Some(Utc::now());
            info!(uid = %self.uid, name = %self.name, host = %self.host, "job started");
        }

        let result = match pool.connect(&self.host).await {
            Ok(client) => {
                let handler = Arc::clone(&self.handler);
                let ctx = HandlerContext {
                    dispatcher,
                    uid: &self.uid,
                    event,
                    client,
                    details: &mut self.details,
                };
                handler.handle(ctx).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(update) => {
                self.attempts = 0;
                self.apply(update);
                Ok(Processed::Handled)
            }
            Err(e) if e.is_retryable() => {
                pool.drop_client(&self.host).await;
                if !retry {
                    error!(uid = %self.uid, event, error = %e, "transport failure");
                    return Err(e);
                }
                self.attempts += 1;
                if self.attempts > self.retry_policy.max_retries {
                    error!(uid = %self.uid, event, attempts = self.attempts, error = %e, "giving up after repeated transport failures");
                    return Err(e);
                }
                warn!(uid = %self.uid, event, attempts = self.attempts, error = %e, "transport failure, requeueing");
                tokio::time::sleep(self.retry_policy.delay).await;
                dispatcher.enqueue(&self.uid, event);
                Ok(Processed::Requeued)
            }
            Err(e) => {
                error!(uid = %self.uid, event, error = %e, "job failed");
                Err(e)
            }
        }
    }

    fn apply(&mut self, update: JobUpdate) {
        match update {
            JobUpdate::Idle => {}
            JobUpdate::Progress(progress) if progress.is_finite() => {
                self.progress = progress.clamp(0.0, 1.0)
            }
            JobUpdate::Progress(progress) => {
                warn!(uid = %self.uid, progress, "ignoring non-finite progress");
            }
            JobUpdate::Succeeded => {
                self.progress = 1.0;
                self.finish(JobStatus::Succeed);
            }
            JobUpdate::Failed { message } => {
                self.failure = Some(message);
                self.finish(JobStatus::Failed);
            }
        }
    }

    fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
        info!(uid = %self.uid, status = %status, elapsed = ?self.elapsed_time(), "job finished");
    }

    /// Cancels a job that has not finished. Takes effect before the next round.
    pub fn cancel(&mut self) -> Result<(), RemoteError> {
        if self.status.is_terminal() {
            return Err(RemoteError::InvalidTransition {
                from: self.status,
                to: JobStatus::Cancelled,
            });
        }
        self.finish(JobStatus::Cancelled);
        Ok(())
    }

    /// Records an error that escaped `process`, with its source chain as the traceback.
    pub fn mark_failed(&mut self, error: &(dyn std::error::Error + 'static)) -> Result<(), RemoteError> {
        if self.status.is_terminal() {
            return Err(RemoteError::InvalidTransition {
                from: self.status,
                to: JobStatus::Failed,
            });
        }
        self.failure = Some(error.to_string());
        let mut chain = vec![];
        let mut source = error.source();
        while let Some(inner) = source {
            chain.push(format!("caused by: {}", inner));
            source = inner.source();
        }
        self.traceback = (!chain.is_empty()).then(|| chain.join("\n"));
        self.finish(JobStatus::Failed);
        Ok(())
    }

    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            uid: self.uid.clone(),
            name: self.name.clone(),
            host: self.host.clone(),
            handler: self.handler.name().to_string(),
            status: self.status,
            progress: self.progress,
            start_time: self.start_time,
            end_time: self.end_time,
            failure: self.failure.clone(),
            traceback: self.traceback.clone(),
            details: self.details.clone(),
            attempts: self.attempts,
        }
    }

    pub fn to_json(&self) -> Result<String, RemoteError> {
        Ok(serde_json::to_string(&self.to_record())?)
    }

    /// Rebuilds a job, rebinding its handler by name.
    pub fn from_record(record: JobRecord, handlers: &HandlerRegistry) -> Result<Self, RemoteError> {
        let handler = handlers.get(&record.handler).ok_or_else(|| {
            RemoteError::Config(format!("no task handler named '{}'", record.handler))
        })?;
        Ok(Self {
            uid: record.uid,
            name: record.name,
            host: record.host,
            handler,
            status: record.status,
            progress: record.progress,
            start_time: record.start_time,
            end_time: record.end_time,
            failure: record.failure,
            traceback: record.traceback,
            details: record.details,
            attempts: record.attempts,
            retry_policy: RetryPolicy::default(),
        })
    }

    pub fn from_json(json: &str, handlers: &HandlerRegistry) -> Result<Self, RemoteError> {
        Self::from_record(serde_json::from_str(json)?, handlers)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("handler", &self.handler.name())
            .field("status", &self.status)
            .field("progress", &self.progress)
            .finish()
    }
}
