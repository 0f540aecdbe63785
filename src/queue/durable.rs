//! SQLite-backed queue. `enqueue` only persists; a `WorkerPool` runs the jobs.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{Job, JobStatus, NewJob};
use crate::error::Result;
use crate::id::now_ms;
use crate::queue::{Attempt, Enqueued, JobHandler, JobQueue, QueueStats, RetryPolicy, run_attempt};
use crate::store::StateStore;

/// Default time a worker holds a claimed job before others may take it
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// Durable, at-least-once job queue.
pub struct DurableQueue {
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    lease: Duration,
}

impl DurableQueue {
    pub fn new(store: Arc<dyn StateStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Atomically start the oldest due job, including one whose lease ran out.
    pub fn claim_next(&self) -> Result<Option<Job>> {
        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX);
        self.store.claim_next_job(now_ms(), lease_ms)
    }

    /// Requeue jobs a stopped worker left started.
    ///
    /// Only safe while no live worker shares the database, e.g. at startup.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let recovered = self.store.requeue_started_jobs("interrupted before finishing; requeued")?;
        if recovered > 0 {
            tracing::warn!(recovered, "Requeued interrupted jobs");
        }
        Ok(recovered)
    }

    /// Claim one due job and run a single attempt of it.
    ///
    /// Returns the job with its resulting state, or `None` when nothing is due.
    pub async fn process_next(&self, handler: &dyn JobHandler) -> Result<Option<(Job, Attempt)>> {
        let Some(mut job) = self.claim_next()? else {
            return Ok(None);
        };
        tracing::info!(job_id = %job.id, job_type = %job.job_type, target_id = job.target_id, "Claimed job");
        let attempt = run_attempt(self.store.as_ref(), handler, &self.retry, &mut job).await?;
        Ok(Some((job, attempt)))
    }
}

#[async_trait]
impl JobQueue for DurableQueue {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn enqueue(&self, new: NewJob) -> Result<Enqueued> {
        let (job, inserted) = self.store.insert_job(new, self.retry.max_attempts)?;
        if inserted {
            tracing::info!(job_id = %job.id, key = %job.idempotency_key, "Enqueued job");
        } else {
            tracing::debug!(job_id = %job.id, key = %job.idempotency_key, "Coalesced duplicate job");
        }
        Ok(Enqueued {
            job,
            coalesced: !inserted,
        })
    }

    fn stats(&self) -> Result<QueueStats> {
        QueueStats::collect(self.store.as_ref())
    }

    fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        self.store.list_jobs(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobType;
    use crate::queue::testing::{ScriptedHandler, unavailable};
    use crate::store::SqliteStore;
    use std::time::Duration;

    fn queue(retry: RetryPolicy) -> DurableQueue {
        DurableQueue::new(Arc::new(SqliteStore::open_in_memory().unwrap()), retry)
    }

    #[tokio::test]
    async fn test_enqueue_only_persists() {
        let queue = queue(RetryPolicy::default());
        let enqueued = queue.enqueue(NewJob::new(JobType::PlanProtocol, 1, 1, 1)).await.unwrap();
        assert!(!enqueued.coalesced);
        assert_eq!(enqueued.job.status, JobStatus::Queued);
        assert_eq!(queue.stats().unwrap().queued, 1);

        let again = queue.enqueue(NewJob::new(JobType::PlanProtocol, 1, 1, 1)).await.unwrap();
        assert!(again.coalesced);
        assert_eq!(again.job.id, enqueued.job.id);
    }

    #[tokio::test]
    async fn test_process_next_runs_one_job() {
        let queue = queue(RetryPolicy::default());
        let handler = ScriptedHandler::new(vec![]);
        queue.enqueue(NewJob::new(JobType::ExecuteStep, 1, 1, 1)).await.unwrap();
        queue.enqueue(NewJob::new(JobType::ExecuteStep, 2, 1, 1)).await.unwrap();

        let (job, attempt) = queue.process_next(&handler).await.unwrap().unwrap();
        assert_eq!(attempt, Attempt::Finished);
        assert_eq!(job.target_id, 1);
        assert_eq!(queue.stats().unwrap().queued, 1);
    }

    #[tokio::test]
    async fn test_recover_interrupted_requeues_started_job() {
        let queue = queue(RetryPolicy::default());
        queue.enqueue(NewJob::new(JobType::ExecuteStep, 1, 1, 1)).await.unwrap();
        let claimed = queue.claim_next().unwrap().unwrap();
        assert!(queue.claim_next().unwrap().is_none());

        assert_eq!(queue.recover_interrupted().unwrap(), 1);
        let handler = ScriptedHandler::new(vec![]);
        let (job, attempt) = queue.process_next(&handler).await.unwrap().unwrap();
        assert_eq!(job.id, claimed.id);
        assert_eq!(job.attempt, 2);
        assert_eq!(attempt, Attempt::Finished);
    }

    #[tokio::test]
    async fn test_zero_lease_makes_started_job_due() {
        let queue = queue(RetryPolicy::default()).with_lease(Duration::ZERO);
        queue.enqueue(NewJob::new(JobType::ExecuteStep, 1, 1, 1)).await.unwrap();
        let first = queue.claim_next().unwrap().unwrap();
        let second = queue.claim_next().unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn test_retry_is_not_due_until_backoff_elapses() {
        let queue = queue(RetryPolicy::new(3, Duration::from_secs(30), Duration::from_secs(60)));
        let handler = ScriptedHandler::new(vec![Err(unavailable())]);
        queue.enqueue(NewJob::new(JobType::ExecuteStep, 1, 1, 1)).await.unwrap();

        let (_, attempt) = queue.process_next(&handler).await.unwrap().unwrap();
        assert_eq!(attempt, Attempt::Retry(Duration::from_secs(30)));
        assert!(queue.process_next(&handler).await.unwrap().is_none());
        assert_eq!(queue.stats().unwrap().queued, 1);
    }
}
