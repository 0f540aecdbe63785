//! Worker pool polling a `DurableQueue`.
//!
//! The pool has an explicit lifecycle: `start` spawns the workers, `stop`
//! signals them through a watch channel and waits for them to finish their
//! current job.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::id::generate_worker_id;
use crate::queue::{DurableQueue, JobHandler};

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    /// Idle sleep between polls
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Running set of queue workers.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.workers` tasks polling the queue.
    pub fn start(queue: Arc<DurableQueue>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = (0..config.workers.max(1))
            .map(|index| {
                let worker_id = generate_worker_id(index);
                let queue = queue.clone();
                let handler = handler.clone();
                let rx = shutdown_rx.clone();
                let poll_interval = config.poll_interval;
                tokio::spawn(async move { worker_loop(worker_id, queue, handler, rx, poll_interval).await })
            })
            .collect::<Vec<_>>();

        tracing::info!(workers = handles.len(), "Worker pool started");
        Self { shutdown, handles }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker and wait for them to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }

    /// Process due jobs on the current task until none are left.
    ///
    /// Retries scheduled in the future are left queued. Returns the number of
    /// attempts run.
    pub async fn run_until_idle(queue: &DurableQueue, handler: &dyn JobHandler) -> Result<usize> {
        let mut attempts = 0;
        while queue.process_next(handler).await?.is_some() {
            attempts += 1;
        }
        Ok(attempts)
    }
}

async fn worker_loop(
    worker_id: String,
    queue: Arc<DurableQueue>,
    handler: Arc<dyn JobHandler>,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    tracing::debug!(worker = %worker_id, "Worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        match queue.process_next(handler.as_ref()).await {
            // More work may be due; poll again straight away
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => tracing::error!(worker = %worker_id, error = %e, "Job processing failed"),
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    tracing::debug!(worker = %worker_id, "Worker stopped");
}
