//! Orchestrator
//!
//! Owns the action endpoints (start, run, approve, retry, cancel, ...),
//! applies policy decisions to step outcomes, and is the `JobHandler` both
//! queue backends run jobs through.
//!
//! Every endpoint takes an optional expected status. A precondition that does
//! not hold returns `StateConflict` and leaves a `transition_rejected` event.

mod actions;
mod outcome;
mod planning;

use async_trait::async_trait;
use serde_json::json;
use std::fmt::Display;
use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::dispatch::Dispatcher;
use crate::domain::{
    Job, JobType, NewEvent, NewJob, ProtocolRun, ProtocolStatus, ProtocolUpdate, StepRun, StepStatus, StepUpdate,
    event_types,
};
use crate::error::{ProtoflowError, Result};
use crate::policy::{FailureKind, StepOutcome};
use crate::queue::{JobHandler, JobQueue};
use crate::store::StateStore;

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn JobQueue>,
    dispatcher: Dispatcher,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn JobQueue>,
        dispatcher: Dispatcher,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            dispatcher,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Record a rejected transition and hand the error back.
    ///
    /// Only conflicts and invalid transitions are recorded; other errors pass through.
    fn rejected(&self, protocol_run_id: i64, step_run_id: Option<i64>, action: &str, error: ProtoflowError) -> ProtoflowError {
        if !matches!(
            error,
            ProtoflowError::StateConflict { .. } | ProtoflowError::InvalidTransition { .. }
        ) {
            return error;
        }

        log::warn!("Rejected {}: {}", action, error);
        let mut event = NewEvent::protocol(
            event_types::TRANSITION_REJECTED,
            protocol_run_id,
            format!("{} rejected: {}", action, error),
        )
        .with_metadata(json!({ "action": action }));
        event.step_run_id = step_run_id;
        if let Err(e) = self.store.append_event(event) {
            log::error!("Failed to record rejected transition: {}", e);
        }
        error
    }

    /// Check the caller's expectation and the action's allowed source states.
    fn guard_protocol(
        &self,
        run: &ProtocolRun,
        expected: Option<ProtocolStatus>,
        allowed: &[ProtocolStatus],
        action: &str,
    ) -> Result<()> {
        let violation = match expected {
            Some(expected) if expected != run.status => Some(expected.to_string()),
            _ if !allowed.contains(&run.status) => Some(join_states(allowed)),
            _ => None,
        };
        match violation {
            Some(expected) => Err(self.rejected(
                run.id,
                None,
                action,
                ProtoflowError::StateConflict {
                    entity: "protocol_run",
                    id: run.id,
                    expected,
                    actual: run.status.to_string(),
                },
            )),
            None => Ok(()),
        }
    }

    fn guard_step(&self, step: &StepRun, expected: Option<StepStatus>, allowed: &[StepStatus], action: &str) -> Result<()> {
        let violation = match expected {
            Some(expected) if expected != step.status => Some(expected.to_string()),
            _ if !allowed.contains(&step.status) => Some(join_states(allowed)),
            _ => None,
        };
        match violation {
            Some(expected) => Err(self.rejected(
                step.protocol_run_id,
                Some(step.id),
                action,
                ProtoflowError::StateConflict {
                    entity: "step_run",
                    id: step.id,
                    expected,
                    actual: step.status.to_string(),
                },
            )),
            None => Ok(()),
        }
    }

    fn set_protocol(&self, run: &ProtocolRun, update: ProtocolUpdate, action: &str) -> Result<ProtocolRun> {
        self.store
            .update_protocol(run.id, run.status, update)
            .map_err(|e| self.rejected(run.id, None, action, e))
    }

    /// Guarded step write; a rejected one leaves a `transition_rejected` event.
    pub(crate) fn set_step(&self, step: &StepRun, update: StepUpdate, action: &str) -> Result<StepRun> {
        self.store
            .update_step(step.id, step.status, update)
            .map_err(|e| self.rejected(step.protocol_run_id, Some(step.id), action, e))
    }

    /// Move a planned or blocked protocol to running; running stays as is.
    fn ensure_protocol_running(&self, run: &ProtocolRun, action: &str) -> Result<ProtocolRun> {
        match run.status {
            ProtocolStatus::Running => Ok(run.clone()),
            ProtocolStatus::Planned | ProtocolStatus::Blocked => {
                self.set_protocol(run, ProtocolUpdate::to(ProtocolStatus::Running), action)
            }
            _ => Err(self.rejected(
                run.id,
                None,
                action,
                ProtoflowError::StateConflict {
                    entity: "protocol_run",
                    id: run.id,
                    expected: join_states(&[ProtocolStatus::Planned, ProtocolStatus::Running, ProtocolStatus::Blocked]),
                    actual: run.status.to_string(),
                },
            )),
        }
    }

    async fn enqueue_execution(&self, step: &StepRun) -> Result<()> {
        let job = NewJob::execute_step(step);
        self.store.append_event(
            NewEvent::step(
                event_types::STEP_ENQUEUED,
                step.protocol_run_id,
                step.id,
                format!("Execution enqueued for {}", step.step_name),
            )
            .with_metadata(json!({ "idempotency_key": job.idempotency_key })),
        )?;
        self.queue.enqueue(job).await?;
        Ok(())
    }

    async fn execute_step_job(&self, step_run_id: i64) -> Result<()> {
        let outcome = self.dispatcher.execute(step_run_id).await?;
        self.apply_dispatch(step_run_id, outcome).await
    }

    async fn run_qa_job(&self, step_run_id: i64) -> Result<()> {
        let outcome = self.dispatcher.evaluate_qa(step_run_id).await?;
        self.apply_dispatch(step_run_id, outcome).await
    }
}

#[async_trait]
impl JobHandler for Orchestrator {
    async fn handle(&self, job: &Job) -> Result<()> {
        log::debug!("Handling {} job {} for {}", job.job_type, job.id, job.target_id);
        match job.job_type {
            JobType::PlanProtocol => self.plan_protocol(job.target_id).await,
            JobType::ExecuteStep => self.execute_step_job(job.target_id).await,
            JobType::RunQa => self.run_qa_job(job.target_id).await,
        }
    }

    async fn on_exhausted(&self, job: &Job, error: &ProtoflowError) -> Result<()> {
        match job.job_type {
            JobType::PlanProtocol => self.planning_failed(job.target_id, &error.to_string()),
            JobType::ExecuteStep => {
                self.handle_step_outcome(job.target_id, StepOutcome::Failure(FailureKind::Execution), error.to_string())
                    .await
            }
            JobType::RunQa => {
                self.handle_step_outcome(job.target_id, StepOutcome::Failure(FailureKind::Qa), error.to_string())
                    .await
            }
        }
    }
}

fn join_states<T: Display>(states: &[T]) -> String {
    states.iter().map(|s| s.to_string()).collect::<Vec<_>>().join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, QueueBackend};
    use crate::context::AppContext;
    use crate::domain::{NewProject, NewProtocolRun, NewStepRun, QaPolicy, StepType};
    use crate::policy::{FailureKind, PolicyCondition, StepOutcome, StepPolicy, TriggerPolicy};
    use crate::engine::{EngineRegistry, ScriptedEngine};
    use crate::spec::{ProtocolSpec, StepSpec};
    use crate::store::SqliteStore;
    use std::fs;
    use tempfile::TempDir;

    fn context(auto_advance: bool) -> AppContext {
        let mut config = Config::default();
        config.queue.backend = QueueBackend::Durable;
        config.orchestrator.auto_advance = auto_advance;
        AppContext::build(
            config,
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            EngineRegistry::new().with(Arc::new(ScriptedEngine::new("codex"))),
            None,
        )
        .unwrap()
    }

    fn protocol(ctx: &AppContext, new: impl FnOnce(i64) -> NewProtocolRun) -> ProtocolRun {
        let project = ctx
            .orchestrator
            .create_project(NewProject::new("demo", "/srv/demo").with_qa_policy(QaPolicy::Skip))
            .unwrap();
        ctx.orchestrator.create_protocol_run(new(project.id)).unwrap()
    }

    fn with_steps(project_id: i64, names: &[&str]) -> NewProtocolRun {
        NewProtocolRun::new(project_id, "feature", "main").with_spec(ProtocolSpec {
            steps: names.iter().map(|n| StepSpec::new(*n)).collect(),
            ..Default::default()
        })
    }

    fn recorded(ctx: &AppContext, id: i64) -> Vec<String> {
        ctx.store
            .list_events(Some(id))
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[test]
    fn test_join_states() {
        assert_eq!(
            join_states(&[StepStatus::Pending, StepStatus::NeedsQa]),
            "pending|needs_qa"
        );
        assert_eq!(join_states::<StepStatus>(&[]), "");
    }

    #[test]
    fn test_rejected_records_only_state_errors() {
        let ctx = context(true);
        let run = protocol(&ctx, |p| with_steps(p, &["01-a"]));
        let orch = &ctx.orchestrator;

        let conflict = ProtoflowError::StateConflict {
            entity: "protocol_run",
            id: run.id,
            expected: "running".into(),
            actual: "pending".into(),
        };
        assert!(orch.rejected(run.id, None, "test", conflict).is_conflict());
        let other = orch.rejected(run.id, None, "test", ProtoflowError::Storage("disk".into()));
        assert!(matches!(other, ProtoflowError::Storage(_)));

        let rejected: Vec<_> = recorded(&ctx, run.id)
            .into_iter()
            .filter(|e| e == event_types::TRANSITION_REJECTED)
            .collect();
        assert_eq!(rejected.len(), 1);
    }

    #[tokio::test]
    async fn test_start_queues_planning_once() {
        let ctx = context(true);
        let run = protocol(&ctx, |p| with_steps(p, &["01-a", "02-b"]));

        let planning = ctx.orchestrator.start(run.id, None).await.unwrap();
        assert_eq!(planning.status, ProtocolStatus::Planning);
        let err = ctx.orchestrator.start(run.id, None).await.unwrap_err();
        assert!(err.is_conflict());

        let jobs = ctx.queue().list_jobs(None).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::PlanProtocol);
        assert!(recorded(&ctx, run.id).contains(&event_types::PLANNING_ENQUEUED.to_string()));
    }

    #[tokio::test]
    async fn test_planning_without_auto_advance_stops_at_planned() {
        let ctx = context(false);
        let run = protocol(&ctx, |p| with_steps(p, &["01-a", "02-b"]));

        ctx.orchestrator.start(run.id, None).await.unwrap();
        ctx.drain().await.unwrap();

        let planned = ctx.store.protocol_run(run.id).unwrap();
        assert_eq!(planned.status, ProtocolStatus::Planned);
        let steps = ctx.store.list_step_runs(run.id).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
        // Steps inherit the project's QA policy
        assert!(steps.iter().all(|s| s.qa_policy == QaPolicy::Skip));
    }

    #[tokio::test]
    async fn test_planning_reads_step_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("01-setup.md"), "Set up the workspace").unwrap();
        fs::write(temp.path().join("02-build.md"), "Build it").unwrap();
        fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let ctx = context(false);
        let run = protocol(&ctx, |p| {
            NewProtocolRun::new(p, "from-files", "main").with_protocol_root(temp.path())
        });
        ctx.orchestrator.start(run.id, None).await.unwrap();
        ctx.drain().await.unwrap();

        let names: Vec<String> = ctx
            .store
            .list_step_runs(run.id)
            .unwrap()
            .into_iter()
            .map(|s| s.step_name)
            .collect();
        assert_eq!(names, vec!["01-setup.md", "02-build.md"]);
        assert_eq!(ctx.store.protocol_run(run.id).unwrap().status, ProtocolStatus::Planned);
    }

    #[tokio::test]
    async fn test_missing_spec_blocks() {
        let ctx = context(true);
        let run = protocol(&ctx, |p| NewProtocolRun::new(p, "empty", "main"));

        ctx.orchestrator.start(run.id, None).await.unwrap();
        ctx.drain().await.unwrap();

        assert_eq!(ctx.store.protocol_run(run.id).unwrap().status, ProtocolStatus::Blocked);
        assert!(recorded(&ctx, run.id).contains(&event_types::SPEC_VALIDATION_ERROR.to_string()));
    }

    #[tokio::test]
    async fn test_exhausted_planning_job_blocks() {
        let ctx = context(true);
        let run = protocol(&ctx, |p| with_steps(p, &["01-a"]));
        let planning = ctx.orchestrator.start(run.id, None).await.unwrap();

        let job = NewJob::plan_protocol(&planning).into_record(3);
        ctx.orchestrator
            .on_exhausted(&job, &ProtoflowError::Storage("disk full".into()))
            .await
            .unwrap();

        assert_eq!(ctx.store.protocol_run(run.id).unwrap().status, ProtocolStatus::Blocked);
        assert!(recorded(&ctx, run.id).contains(&event_types::PROTOCOL_BLOCKED.to_string()));
    }

    #[tokio::test]
    async fn test_run_step_rejects_paused_protocol() {
        let ctx = context(false);
        let run = protocol(&ctx, |p| with_steps(p, &["01-a"]));
        ctx.orchestrator.start(run.id, None).await.unwrap();
        ctx.drain().await.unwrap();
        ctx.orchestrator.pause(run.id, Some(ProtocolStatus::Planned)).unwrap();

        let step = ctx.store.list_step_runs(run.id).unwrap()[0].clone();
        let err = ctx.orchestrator.run_step(step.id, None).await.unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(ctx.store.step_run(step.id).unwrap().status, StepStatus::Pending);
        assert!(recorded(&ctx, run.id).contains(&event_types::TRANSITION_REJECTED.to_string()));
    }

    #[tokio::test]
    async fn test_approve_requires_needs_qa() {
        let ctx = context(false);
        let run = protocol(&ctx, |p| with_steps(p, &["01-a"]));
        ctx.orchestrator.start(run.id, None).await.unwrap();
        ctx.drain().await.unwrap();

        let step = ctx.store.list_step_runs(run.id).unwrap()[0].clone();
        let err = ctx.orchestrator.approve(step.id, None).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_retry_without_failed_step() {
        let ctx = context(false);
        let run = protocol(&ctx, |p| with_steps(p, &["01-a"]));
        ctx.orchestrator.start(run.id, None).await.unwrap();
        ctx.drain().await.unwrap();
        ctx.orchestrator.run_next_step(run.id, None).await.unwrap();

        let err = ctx.orchestrator.retry_latest(run.id, None).await.unwrap_err();
        assert!(matches!(err, ProtoflowError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_run_next_step_completes_finished_protocol() {
        let ctx = context(false);
        let run = protocol(&ctx, |p| with_steps(p, &["01-a"]));
        ctx.orchestrator.start(run.id, None).await.unwrap();
        ctx.drain().await.unwrap();
        ctx.orchestrator.run_next_step(run.id, None).await.unwrap();
        ctx.drain().await.unwrap();
        assert_eq!(ctx.store.protocol_run(run.id).unwrap().status, ProtocolStatus::Completed);

        // Nothing left and the protocol is terminal
        let err = ctx.orchestrator.run_next_step(run.id, None).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_failure_trigger_without_target_blocks() {
        let ctx = context(false);
        let run = protocol(&ctx, |p| with_steps(p, &["01-a"]));
        ctx.orchestrator.start(run.id, None).await.unwrap();
        ctx.drain().await.unwrap();

        // A step whose trigger names no step of this protocol
        let step = ctx
            .store
            .create_step_run(NewStepRun {
                protocol_run_id: run.id,
                step_index: 1,
                step_name: "02-orphan".into(),
                step_type: StepType::Work,
                engine_id: None,
                model: None,
                qa_policy: QaPolicy::Skip,
                description: None,
                prompt: None,
                policy: StepPolicy {
                    loop_policy: None,
                    trigger: Some(TriggerPolicy::new(["99-ghost"]).when(PolicyCondition::ExecFailed)),
                },
            })
            .unwrap();
        ctx.orchestrator.run_step(step.id, None).await.unwrap();

        ctx.orchestrator
            .handle_step_outcome(step.id, StepOutcome::Failure(FailureKind::Execution), "boom".into())
            .await
            .unwrap();

        assert_eq!(ctx.store.step_run(step.id).unwrap().status, StepStatus::Failed);
        assert_eq!(ctx.store.protocol_run(run.id).unwrap().status, ProtocolStatus::Blocked);
        let events = recorded(&ctx, run.id);
        assert!(events.contains(&event_types::TRIGGER_DECISION.to_string()));
        assert!(events.contains(&event_types::TRIGGER_MISSING_TARGET.to_string()));
    }
}
