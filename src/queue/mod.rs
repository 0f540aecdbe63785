//! Queue abstraction
//!
//! This module provides:
//! - `JobQueue`: idempotent job submission keyed by `{job_type}:{target}:v{version}`
//! - `JobHandler`: the callback a queue runs jobs through
//! - `InlineQueue`: runs each job immediately on the calling task
//! - `DurableQueue` + `WorkerPool`: persisted jobs polled by tokio workers
//!
//! Both backends share `run_attempt`, so retries, backoff and the visible job
//! states (queued → started → finished | failed) are identical.

pub mod durable;
pub mod inline;
pub mod retry;
pub mod worker;

pub use durable::DurableQueue;
pub use inline::InlineQueue;
pub use retry::RetryPolicy;
pub use worker::{WorkerConfig, WorkerPool};

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::domain::{Job, JobStatus, JobType, NewEvent, NewJob, event_types};
use crate::error::{ProtoflowError, Result};
use crate::id::now_ms;
use crate::store::StateStore;

/// Runs jobs on behalf of a queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Perform one attempt. Retryable errors are retried while attempts remain.
    async fn handle(&self, job: &Job) -> Result<()>;

    /// Called once a job is terminally failed, after its `job_failed` event.
    async fn on_exhausted(&self, job: &Job, error: &ProtoflowError) -> Result<()>;
}

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct Enqueued {
    /// The stored job (the pre-existing one when coalesced)
    pub job: Job,
    /// True when a job with the same idempotency key already existed
    pub coalesced: bool,
}

/// Job counts by visible state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub started: usize,
    pub finished: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn collect(store: &dyn StateStore) -> Result<Self> {
        Ok(Self {
            queued: store.count_jobs(JobStatus::Queued)?,
            started: store.count_jobs(JobStatus::Started)?,
            finished: store.count_jobs(JobStatus::Finished)?,
            failed: store.count_jobs(JobStatus::Failed)?,
        })
    }

    pub fn total(&self) -> usize {
        self.queued + self.started + self.finished + self.failed
    }
}

/// Job submission, shared by every backend.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Backend name for logs and the CLI
    fn name(&self) -> &'static str;

    /// Submit a job. Duplicate keys are coalesced, never duplicated.
    async fn enqueue(&self, job: NewJob) -> Result<Enqueued>;

    fn stats(&self) -> Result<QueueStats>;

    fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>>;
}

/// What became of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Finished,
    /// Requeued; due again after the delay
    Retry(Duration),
    Failed,
}

/// Run one attempt of a job that is already marked started.
///
/// Persists the resulting job state. On terminal failure a `job_failed` event
/// is appended before `on_exhausted` runs; errors from the hook are logged.
pub async fn run_attempt(
    store: &dyn StateStore,
    handler: &dyn JobHandler,
    retry: &RetryPolicy,
    job: &mut Job,
) -> Result<Attempt> {
    tracing::debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt, "Running job");

    let error = match handler.handle(job).await {
        Ok(()) => {
            job.mark_finished();
            store.save_job(job)?;
            tracing::debug!(job_id = %job.id, "Job finished");
            return Ok(Attempt::Finished);
        }
        Err(e) => e,
    };

    if error.is_retryable() && job.has_attempts_left() {
        let delay = retry.backoff(job.attempt.saturating_sub(1));
        job.mark_retry(&error.to_string(), now_ms() + delay.as_millis() as i64);
        store.save_job(job)?;
        tracing::warn!(
            job_id = %job.id,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Job failed, retrying"
        );
        return Ok(Attempt::Retry(delay));
    }

    job.mark_failed(&error.to_string());
    store.save_job(job)?;
    tracing::error!(job_id = %job.id, attempt = job.attempt, error = %error, "Job failed terminally");

    store.append_event(job_failed_event(job, &error))?;
    if let Err(hook_error) = handler.on_exhausted(job, &error).await {
        tracing::error!(job_id = %job.id, error = %hook_error, "Exhaustion hook failed");
    }
    Ok(Attempt::Failed)
}

fn job_failed_event(job: &Job, error: &ProtoflowError) -> NewEvent {
    let message = format!(
        "{} job for {} failed after {} attempt(s): {}",
        job.job_type, job.target_id, job.attempt, error
    );
    let mut event = match job.protocol_run_id() {
        Some(protocol_run_id) => NewEvent::protocol(event_types::JOB_FAILED, protocol_run_id, message),
        None => NewEvent::new(event_types::JOB_FAILED, message),
    };
    if matches!(job.job_type, JobType::ExecuteStep | JobType::RunQa) {
        event.step_run_id = Some(job.target_id);
    }
    event.with_metadata(serde_json::json!({
        "job_id": job.id,
        "job_type": job.job_type,
        "idempotency_key": job.idempotency_key,
        "attempt": job.attempt,
        "retryable": error.is_retryable(),
    }))
}
