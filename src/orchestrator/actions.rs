//! Action endpoints.

use serde_json::json;

use crate::domain::{
    NewEvent, NewJob, NewProject, NewProtocolRun, Project, ProtocolRun, ProtocolStatus, ProtocolUpdate, QaPolicy,
    RuntimeState, StepRun, StepStatus, StepUpdate, event_types,
};
use crate::error::{ProtoflowError, Result};
use crate::orchestrator::{Orchestrator, join_states};

impl Orchestrator {
    pub fn create_project(&self, new: NewProject) -> Result<Project> {
        let project = self.store.create_project(new)?;
        log::info!("Created project {} ({})", project.id, project.name);
        Ok(project)
    }

    pub fn create_protocol_run(&self, new: NewProtocolRun) -> Result<ProtocolRun> {
        self.store.project(new.project_id)?;
        let run = self.store.create_protocol_run(new)?;
        self.store.append_event(NewEvent::protocol(
            event_types::PROTOCOL_CREATED,
            run.id,
            format!("Created protocol {}", run.protocol_name),
        ))?;
        log::info!("Created protocol run {} ({})", run.id, run.protocol_name);
        Ok(run)
    }

    /// Move a protocol to `planning` and enqueue its planning job.
    pub async fn start(&self, protocol_run_id: i64, expected: Option<ProtocolStatus>) -> Result<ProtocolRun> {
        let run = self.store.protocol_run(protocol_run_id)?;
        self.guard_protocol(
            &run,
            expected,
            &[ProtocolStatus::Pending, ProtocolStatus::Planned, ProtocolStatus::Blocked],
            "start",
        )?;

        let planning = self.set_protocol(&run, ProtocolUpdate::to(ProtocolStatus::Planning), "start")?;
        let job = NewJob::plan_protocol(&planning);
        self.store.append_event(
            NewEvent::protocol(event_types::PLANNING_ENQUEUED, run.id, "Planning enqueued")
                .with_metadata(json!({ "idempotency_key": job.idempotency_key })),
        )?;
        self.queue.enqueue(job).await?;
        self.store.protocol_run(run.id)
    }

    /// Run the first step that is not completed yet.
    ///
    /// Returns `None` when every step is done; the protocol is completed then.
    pub async fn run_next_step(
        &self,
        protocol_run_id: i64,
        expected: Option<ProtocolStatus>,
    ) -> Result<Option<StepRun>> {
        let run = self.store.protocol_run(protocol_run_id)?;
        self.guard_protocol(
            &run,
            expected,
            &[ProtocolStatus::Planned, ProtocolStatus::Running, ProtocolStatus::Blocked],
            "run_next_step",
        )?;

        let steps = self.store.list_step_runs(run.id)?;
        let Some(next) = steps.into_iter().find(|s| !s.status.is_terminal()) else {
            let run = self.ensure_protocol_running(&run, "run_next_step")?;
            self.advance(run.id).await?;
            return Ok(None);
        };
        if !next.status.is_runnable() {
            return Err(self.rejected(
                run.id,
                Some(next.id),
                "run_next_step",
                ProtoflowError::StateConflict {
                    entity: "step_run",
                    id: next.id,
                    expected: join_states(&[StepStatus::Pending, StepStatus::Failed, StepStatus::Blocked]),
                    actual: next.status.to_string(),
                },
            ));
        }
        let status = next.status;
        self.run_step(next.id, Some(status)).await.map(Some)
    }

    /// Move a step to `running` and enqueue its execution.
    pub async fn run_step(&self, step_run_id: i64, expected: Option<StepStatus>) -> Result<StepRun> {
        let step = self.store.step_run(step_run_id)?;
        let run = self.store.protocol_run(step.protocol_run_id)?;
        self.guard_protocol(
            &run,
            None,
            &[ProtocolStatus::Planned, ProtocolStatus::Running, ProtocolStatus::Blocked],
            "run",
        )?;
        self.guard_step(
            &step,
            expected,
            &[StepStatus::Pending, StepStatus::Failed, StepStatus::Blocked],
            "run",
        )?;

        self.ensure_protocol_running(&run, "run")?;
        let running = self.set_step(&step, StepUpdate::to(StepStatus::Running), "run")?;
        self.enqueue_execution(&running).await?;
        self.store.step_run(running.id)
    }

    /// Queue a QA evaluation for a step.
    ///
    /// The step is always written to `needs_qa` first so a repeated request
    /// gets a fresh job key.
    pub async fn run_qa(&self, step_run_id: i64, expected: Option<StepStatus>) -> Result<StepRun> {
        let step = self.store.step_run(step_run_id)?;
        let run = self.store.protocol_run(step.protocol_run_id)?;
        self.guard_step(
            &step,
            expected,
            &[StepStatus::Running, StepStatus::Failed, StepStatus::Blocked, StepStatus::NeedsQa],
            "run_qa",
        )?;
        self.ensure_protocol_running(&run, "run_qa")?;

        let needs_qa = self.set_step(&step, StepUpdate::to(StepStatus::NeedsQa), "run_qa")?;
        self.enqueue_qa(&needs_qa, "QA requested").await?;
        self.store.step_run(needs_qa.id)
    }

    /// Accept a step awaiting QA without running QA.
    pub async fn approve(&self, step_run_id: i64, expected: Option<StepStatus>) -> Result<StepRun> {
        let step = self.store.step_run(step_run_id)?;
        self.guard_step(&step, expected, &[StepStatus::NeedsQa], "approve")?;

        let completed = self.set_step(&step, StepUpdate::to(StepStatus::Completed), "approve")?;
        self.store.append_event(NewEvent::step(
            event_types::MANUAL_APPROVAL,
            step.protocol_run_id,
            step.id,
            format!("{} approved manually", step.step_name),
        ))?;

        let run = self.store.protocol_run(step.protocol_run_id)?;
        if run.status == ProtocolStatus::Blocked {
            self.ensure_protocol_running(&run, "approve")?;
        }
        self.advance(run.id).await?;
        self.store.step_run(completed.id)
    }

    /// Retry the latest failed or blocked step.
    ///
    /// This is the only action that clears loop counters.
    pub async fn retry_latest(&self, protocol_run_id: i64, expected: Option<ProtocolStatus>) -> Result<StepRun> {
        let run = self.store.protocol_run(protocol_run_id)?;
        self.guard_protocol(
            &run,
            expected,
            &[ProtocolStatus::Blocked, ProtocolStatus::Running],
            "retry",
        )?;

        let step = self
            .store
            .list_step_runs(run.id)?
            .into_iter()
            .rev()
            .find(|s| matches!(s.status, StepStatus::Failed | StepStatus::Blocked))
            .ok_or_else(|| ProtoflowError::not_found("retryable step_run", format!("protocol {}", run.id)))?;

        self.ensure_protocol_running(&run, "retry")?;
        let retries = step.retries + 1;
        let running = self.set_step(
            &step,
            StepUpdate::to(StepStatus::Running)
                .retries(retries)
                .runtime_state(RuntimeState::default()),
            "retry",
        )?;
        self.store.append_event(
            NewEvent::step(
                event_types::STEP_RETRY,
                run.id,
                step.id,
                format!("Retrying {} (attempt {})", step.step_name, retries),
            )
            .with_metadata(json!({ "retries": retries, "previous_status": step.status })),
        )?;
        self.enqueue_execution(&running).await?;
        self.store.step_run(running.id)
    }

    /// Cancel a protocol and every step that is not finished.
    pub fn cancel(&self, protocol_run_id: i64, expected: Option<ProtocolStatus>) -> Result<ProtocolRun> {
        let run = self.store.protocol_run(protocol_run_id)?;
        let open: Vec<ProtocolStatus> = ProtocolStatus::ALL.into_iter().filter(|s| !s.is_terminal()).collect();
        self.guard_protocol(&run, expected, &open, "cancel")?;

        let cancelled = self.set_protocol(&run, ProtocolUpdate::to(ProtocolStatus::Cancelled), "cancel")?;
        let mut steps_cancelled = 0;
        for step in self.store.list_step_runs(run.id)? {
            if step.status.is_terminal() {
                continue;
            }
            if self.cancel_step(step)? {
                steps_cancelled += 1;
            }
        }

        self.store.append_event(
            NewEvent::protocol(
                event_types::PROTOCOL_CANCELLED,
                run.id,
                format!("Cancelled with {} open step(s)", steps_cancelled),
            )
            .with_metadata(json!({ "previous_status": run.status, "steps_cancelled": steps_cancelled })),
        )?;
        log::info!("Protocol {} cancelled", run.id);
        Ok(cancelled)
    }

    /// A worker may move the step concurrently; re-read once on conflict.
    fn cancel_step(&self, step: StepRun) -> Result<bool> {
        let mut current = step;
        for _ in 0..2 {
            match self
                .store
                .update_step(current.id, current.status, StepUpdate::to(StepStatus::Cancelled))
            {
                Ok(_) => return Ok(true),
                Err(e) if e.is_conflict() => {
                    current = self.store.step_run(current.id)?;
                    if current.status.is_terminal() {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        log::warn!("Step {} kept changing while cancelling", current.id);
        Ok(false)
    }

    pub fn pause(&self, protocol_run_id: i64, expected: Option<ProtocolStatus>) -> Result<ProtocolRun> {
        let run = self.store.protocol_run(protocol_run_id)?;
        self.guard_protocol(
            &run,
            expected,
            &[ProtocolStatus::Running, ProtocolStatus::Planned],
            "pause",
        )?;
        let paused = self.set_protocol(&run, ProtocolUpdate::to(ProtocolStatus::Paused), "pause")?;
        self.store.append_event(NewEvent::protocol(
            event_types::PROTOCOL_PAUSED,
            run.id,
            format!("Paused from {}", run.status),
        ))?;
        Ok(paused)
    }

    /// Resume a paused protocol and re-run whatever was in flight.
    ///
    /// Work discarded while paused is scheduled again: a running step is
    /// re-enqueued, a step awaiting `full` QA gets its QA job back and a
    /// pending step is started. Failed and blocked steps wait for `retry_latest`.
    pub async fn resume(&self, protocol_run_id: i64, expected: Option<ProtocolStatus>) -> Result<ProtocolRun> {
        let run = self.store.protocol_run(protocol_run_id)?;
        self.guard_protocol(&run, expected, &[ProtocolStatus::Paused], "resume")?;
        let running = self.set_protocol(&run, ProtocolUpdate::to(ProtocolStatus::Running), "resume")?;
        self.store.append_event(NewEvent::protocol(event_types::PROTOCOL_RESUMED, run.id, "Resumed"))?;

        let steps = self.store.list_step_runs(run.id)?;
        match steps.into_iter().find(|s| !s.status.is_terminal()) {
            Some(step) if step.status == StepStatus::Running => {
                // Same-status write bumps the version, giving the job a fresh key
                let bumped = self.set_step(&step, StepUpdate::to(StepStatus::Running), "resume")?;
                self.enqueue_execution(&bumped).await?;
            }
            Some(step) if step.status == StepStatus::NeedsQa && step.qa_policy == QaPolicy::Full => {
                let bumped = self.set_step(&step, StepUpdate::to(StepStatus::NeedsQa), "resume")?;
                self.enqueue_qa(&bumped, "QA re-enqueued on resume").await?;
            }
            Some(step) if step.status == StepStatus::Pending => {
                self.run_step(step.id, Some(StepStatus::Pending)).await?;
            }
            Some(_) => {}
            None => self.advance(running.id).await?,
        }
        self.store.protocol_run(running.id)
    }

    async fn enqueue_qa(&self, step: &StepRun, message: &str) -> Result<()> {
        let job = NewJob::run_qa(step);
        self.store.append_event(
            NewEvent::step(event_types::QA_ENQUEUED, step.protocol_run_id, step.id, message)
                .with_metadata(json!({ "idempotency_key": job.idempotency_key })),
        )?;
        self.queue.enqueue(job).await?;
        Ok(())
    }
}
