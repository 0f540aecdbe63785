//! Application context - wires the components together
//!
//! AppContext owns the store, the configured queue backend, the orchestrator
//! (which is also the queue's job handler) and the reconciler.

use std::sync::Arc;

use crate::config::{Config, QueueBackend};
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::engine::{CommandQa, EngineRegistry, QaCapability};
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::queue::{DurableQueue, InlineQueue, JobHandler, JobQueue, RetryPolicy, WorkerConfig, WorkerPool};
use crate::reconcile::Reconciler;
use crate::store::{SqliteStore, StateStore};

pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn StateStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub reconciler: Reconciler,
    /// Set when the durable backend is configured
    durable: Option<Arc<DurableQueue>>,
}

impl AppContext {
    /// Open the SQLite store under the data dir and build engines from config
    pub fn open(config: Config) -> Result<Self> {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open(&config.db_path())?);
        let engines = EngineRegistry::from_config(&config);
        let qa = config
            .qa
            .command
            .clone()
            .map(|command| Arc::new(CommandQa::new(command)) as Arc<dyn QaCapability>);
        Self::build(config, store, engines, qa)
    }

    /// Assemble a context from explicit parts
    pub fn build(
        config: Config,
        store: Arc<dyn StateStore>,
        engines: EngineRegistry,
        qa: Option<Arc<dyn QaCapability>>,
    ) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config.queue);
        let mut inline = None;
        let mut durable = None;
        let queue: Arc<dyn JobQueue> = match config.queue.backend {
            QueueBackend::Inline => {
                let queue = Arc::new(InlineQueue::new(store.clone(), retry));
                inline = Some(queue.clone());
                queue
            }
            QueueBackend::Durable => {
                let queue = Arc::new(DurableQueue::new(store.clone(), retry).with_lease(config.queue.lease()));
                durable = Some(queue.clone());
                queue
            }
        };

        let settings = DispatchSettings {
            default_engine_id: config.orchestrator.default_engine_id.clone(),
            auto_qa_after_exec: config.qa.auto_qa_after_exec,
        };
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue.clone(),
            engines,
            qa,
            config.budget.guard(),
            settings,
        );
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            queue,
            dispatcher,
            config.orchestrator.clone(),
        ));

        if let Some(inline) = inline {
            let handler: Arc<dyn JobHandler> = orchestrator.clone();
            inline.bind(Arc::downgrade(&handler));
        }

        let reconciler = Reconciler::new(orchestrator.clone(), config.qa.auto_qa_on_ci);
        log::debug!("Context ready with {:?} queue backend", config.queue.backend);

        Ok(Self {
            config,
            store,
            orchestrator,
            reconciler,
            durable,
        })
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        self.orchestrator.queue()
    }

    /// Start a worker pool; `None` with the inline backend, which needs no workers
    pub fn start_workers(&self, workers: Option<usize>) -> Option<WorkerPool> {
        let queue = self.durable.clone()?;
        let mut config = WorkerConfig::from_config(&self.config.queue);
        if let Some(workers) = workers {
            config = config.with_workers(workers);
        }
        let handler: Arc<dyn JobHandler> = self.orchestrator.clone();
        Some(WorkerPool::start(queue, handler, config))
    }

    /// Requeue durable jobs left started by a worker that stopped mid-job.
    ///
    /// Call before starting workers; a live worker elsewhere on the same
    /// database would have its in-flight jobs requeued too.
    pub fn recover_interrupted(&self) -> Result<usize> {
        match &self.durable {
            Some(queue) => queue.recover_interrupted(),
            None => Ok(0),
        }
    }

    /// Run one due durable job on this task; false when nothing was due
    pub async fn process_next(&self) -> Result<bool> {
        match &self.durable {
            Some(queue) => Ok(queue.process_next(self.orchestrator.as_ref()).await?.is_some()),
            None => Ok(false),
        }
    }

    /// Recover interrupted jobs, then run due durable jobs on this task until
    /// none is left; returns how many attempts ran
    pub async fn drain(&self) -> Result<usize> {
        let Some(queue) = &self.durable else {
            return Ok(0);
        };
        queue.recover_interrupted()?;
        WorkerPool::run_until_idle(queue, self.orchestrator.as_ref()).await
    }
}
