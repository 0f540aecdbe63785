//! In-process queue: jobs run on the caller's task as soon as they are enqueued.

use async_trait::async_trait;
use std::sync::{Arc, OnceLock, Weak};

use crate::domain::{Job, JobStatus, NewJob};
use crate::error::{ProtoflowError, Result};
use crate::queue::{Attempt, Enqueued, JobHandler, JobQueue, QueueStats, RetryPolicy, run_attempt};
use crate::store::StateStore;

/// Synchronous fallback used when no durable backend is configured.
///
/// Jobs are still persisted and move through the same states as durable
/// jobs. Retries sleep for the backoff in place.
pub struct InlineQueue {
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    handler: OnceLock<Weak<dyn JobHandler>>,
}

impl InlineQueue {
    pub fn new(store: Arc<dyn StateStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            handler: OnceLock::new(),
        }
    }

    /// Attach the handler jobs run through. Returns false if one is already bound.
    ///
    /// The handler usually owns this queue, hence the weak reference.
    pub fn bind(&self, handler: Weak<dyn JobHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    fn handler(&self) -> Result<Arc<dyn JobHandler>> {
        self.handler
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ProtoflowError::Storage("inline queue has no live job handler".to_string()))
    }
}

#[async_trait]
impl JobQueue for InlineQueue {
    fn name(&self) -> &'static str {
        "inline"
    }

    async fn enqueue(&self, new: NewJob) -> Result<Enqueued> {
        let handler = self.handler()?;
        let (mut job, inserted) = self.store.insert_job(new, self.retry.max_attempts)?;
        if !inserted {
            log::debug!("Coalesced job {} ({})", job.id, job.idempotency_key);
            return Ok(Enqueued { job, coalesced: true });
        }

        loop {
            // Held by this task; only a recovery sweep takes it back
            job.mark_started(i64::MAX);
            self.store.save_job(&job)?;
            match run_attempt(self.store.as_ref(), handler.as_ref(), &self.retry, &mut job).await? {
                Attempt::Retry(delay) => tokio::time::sleep(delay).await,
                Attempt::Finished | Attempt::Failed => break,
            }
        }
        Ok(Enqueued { job, coalesced: false })
    }

    fn stats(&self) -> Result<QueueStats> {
        QueueStats::collect(self.store.as_ref())
    }

    fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        self.store.list_jobs(status)
    }
}
