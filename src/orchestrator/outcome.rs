//! Step outcomes: apply the policy decision for a finished or failed step.

use futures::future::BoxFuture;
use serde_json::json;

use crate::dispatch::DispatchOutcome;
use crate::domain::{
    NewEvent, ProtocolRun, ProtocolStatus, ProtocolUpdate, RuntimeState, StepRun, StepStatus, StepUpdate, event_types,
};
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::policy::{BlockReason, ConditionSkip, Decision, FailureKind, StepOutcome, TriggerMode, evaluate};

impl Orchestrator {
    /// Apply the policy engine's decision for a step outcome.
    ///
    /// Success expects a completed step and failure an active one; any other
    /// state means the outcome is stale and it is dropped. Boxed because
    /// inline triggers call back into this through the dispatcher.
    pub fn handle_step_outcome(
        &self,
        step_run_id: i64,
        outcome: StepOutcome,
        detail: String,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let step = self.store.step_run(step_run_id)?;
            let fresh = match outcome {
                StepOutcome::Success(_) => step.status == StepStatus::Completed,
                StepOutcome::Failure(_) => step.status.is_active(),
            };
            if !fresh {
                log::info!(
                    "Dropping stale {:?} outcome for step {} ({})",
                    outcome,
                    step.id,
                    step.status
                );
                return Ok(());
            }

            let evaluation = evaluate(
                outcome,
                &step.policy,
                &step.runtime_state,
                self.config.max_inline_trigger_depth,
            );
            log::debug!("Step {} outcome {:?} -> {:?}", step.id, outcome, evaluation.decision);
            self.record_condition_skips(&step, outcome, &evaluation.skipped)?;

            match evaluation.decision {
                Decision::Advance => self.advance(step.protocol_run_id).await,
                Decision::Loop { loop_count } => self.loop_step(step, loop_count, detail).await,
                Decision::Block {
                    reason: BlockReason::LoopExhausted { max_iterations },
                } => self.block_loop_exhausted(&step, max_iterations, &detail),
                Decision::Block {
                    reason: BlockReason::Unhandled { kind },
                } => self.fail_and_block(&step, kind, &detail, event_types::STEP_FAILED),
                Decision::Trigger { targets, depth, inline } => match outcome {
                    StepOutcome::Failure(kind) => {
                        // The failed step waits for its targets; the protocol keeps running
                        self.fail_step(&step, kind, &detail, event_types::STEP_FAILED)?;
                        let scheduled = self.trigger(&step, &targets, depth, inline).await?;
                        if scheduled == 0 {
                            self.block_protocol(
                                step.protocol_run_id,
                                &format!("{} failed ({}) and no trigger target could run", step.step_name, kind),
                            )?;
                        }
                        Ok(())
                    }
                    StepOutcome::Success(_) => {
                        self.trigger(&step, &targets, depth, inline).await?;
                        self.advance(step.protocol_run_id).await
                    }
                },
            }
        })
    }

    fn record_condition_skips(&self, step: &StepRun, outcome: StepOutcome, skipped: &[ConditionSkip]) -> Result<()> {
        for skip in skipped {
            let (event_type, policy, condition) = match skip {
                ConditionSkip::Loop(condition) => (event_types::LOOP_CONDITION_SKIPPED, "loop", condition),
                ConditionSkip::Trigger(condition) => (event_types::TRIGGER_CONDITION_SKIPPED, "trigger", condition),
            };
            self.store.append_event(
                NewEvent::step(
                    event_type,
                    step.protocol_run_id,
                    step.id,
                    format!(
                        "{} policy of {} waits for {}; outcome was {}",
                        policy,
                        step.step_name,
                        condition,
                        outcome.condition()
                    ),
                )
                .with_metadata(json!({ "condition": condition, "reason": outcome.condition() })),
            )?;
        }
        Ok(())
    }

    /// Feed a dispatcher result into the policy engine.
    pub(crate) async fn apply_dispatch(&self, step_run_id: i64, outcome: DispatchOutcome) -> Result<()> {
        match outcome {
            DispatchOutcome::Completed(kind) => {
                self.handle_step_outcome(step_run_id, StepOutcome::Success(kind), "completed".to_string())
                    .await
            }
            DispatchOutcome::Failed { kind, message } => {
                self.handle_step_outcome(step_run_id, StepOutcome::Failure(kind), message)
                    .await
            }
            DispatchOutcome::AwaitingQa | DispatchOutcome::Degraded | DispatchOutcome::Discarded { .. } => Ok(()),
        }
    }

    /// Mark a step failed and block its protocol.
    pub(crate) fn fail_and_block(&self, step: &StepRun, kind: FailureKind, detail: &str, event_type: &str) -> Result<()> {
        self.fail_step(step, kind, detail, event_type)?;
        self.block_protocol(step.protocol_run_id, &format!("{} failed ({})", step.step_name, kind))
    }

    fn fail_step(&self, step: &StepRun, kind: FailureKind, detail: &str, event_type: &str) -> Result<StepRun> {
        let mut state = step.runtime_state.clone();
        state.last_error = Some(detail.to_string());
        let failed = self.set_step(step, StepUpdate::to(StepStatus::Failed).runtime_state(state), "fail")?;
        self.store.append_event(
            NewEvent::step(
                event_type,
                step.protocol_run_id,
                step.id,
                format!("{} failed: {}", step.step_name, detail),
            )
            .with_metadata(json!({ "kind": kind, "reason": BlockReason::Unhandled { kind }.describe() })),
        )?;
        Ok(failed)
    }

    /// Move the protocol forward after a step finished.
    ///
    /// Runs the next pending step when auto-advance is on and completes the
    /// protocol once every step is completed.
    pub(crate) async fn advance(&self, protocol_run_id: i64) -> Result<()> {
        let run = self.store.protocol_run(protocol_run_id)?;
        if run.status != ProtocolStatus::Running {
            log::debug!("Not advancing protocol {}: status is {}", run.id, run.status);
            return Ok(());
        }

        let steps = self.store.list_step_runs(run.id)?;
        match steps.iter().find(|s| !s.status.is_terminal()) {
            None => {
                if steps.iter().all(|s| s.status == StepStatus::Completed) {
                    self.complete_protocol(&run, steps.len())?;
                }
                Ok(())
            }
            Some(next) if next.status == StepStatus::Pending && self.config.auto_advance => {
                self.run_step(next.id, Some(StepStatus::Pending)).await?;
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    fn complete_protocol(&self, run: &ProtocolRun, step_count: usize) -> Result<()> {
        self.set_protocol(run, ProtocolUpdate::to(ProtocolStatus::Completed), "complete")?;
        self.store.append_event(NewEvent::protocol(
            event_types::PROTOCOL_COMPLETED,
            run.id,
            format!("All {} step(s) completed", step_count),
        ))?;
        log::info!("Protocol {} completed", run.id);
        Ok(())
    }

    /// Reset the failing step, and any steps a step-back reaches, to pending.
    ///
    /// The earliest reset step gets an execute job and the dispatcher claims
    /// it from pending; later ones follow through `advance`.
    async fn loop_step(&self, step: StepRun, loop_count: u32, detail: String) -> Result<()> {
        let steps = self.store.list_step_runs(step.protocol_run_id)?;
        let names: Vec<&str> = steps.iter().map(|s| s.step_name.as_str()).collect();
        let loop_policy = step.policy.loop_policy.as_ref();
        let target_index = loop_policy.map_or(step.step_index, |lp| lp.reset_from(step.step_index, &names));

        let state = RuntimeState {
            loop_count,
            last_error: Some(detail.clone()),
            ..step.runtime_state.clone()
        };
        let mut reset = vec![self.set_step(&step, StepUpdate::to(StepStatus::Pending).runtime_state(state), "loop")?];

        for other in steps.iter().filter(|s| s.step_index >= target_index && s.id != step.id) {
            if matches!(other.status, StepStatus::Pending | StepStatus::Cancelled)
                || loop_policy.is_some_and(|lp| lp.skips_step(&other.step_name))
            {
                continue;
            }
            match self.set_step(other, StepUpdate::to(StepStatus::Pending), "loop") {
                Ok(pending) => reset.push(pending),
                // Recorded as transition_rejected; the rest of the range still resets
                Err(e) if e.is_conflict() => log::info!("Loop reset of step {} skipped: {}", other.id, e),
                Err(e) => return Err(e),
            }
        }
        reset.sort_by_key(|s| s.step_index);

        let steps_reset: Vec<u32> = reset.iter().map(|s| s.step_index).collect();
        let max_iterations = loop_policy.map(|lp| lp.max_iterations);
        self.store.append_event(
            NewEvent::step(
                event_types::LOOP_DECISION,
                step.protocol_run_id,
                step.id,
                format!(
                    "Looping {} back to step index {} (iteration {}): {}",
                    step.step_name, target_index, loop_count, detail
                ),
            )
            .with_metadata(json!({
                "loop_count": loop_count,
                "max_iterations": max_iterations,
                "target_step_index": target_index,
                "steps_reset": steps_reset,
            })),
        )?;
        log::info!(
            "Step {} looping (iteration {}); reset steps {:?}",
            step.id,
            loop_count,
            steps_reset
        );

        match reset.first() {
            Some(first) => self.enqueue_execution(first).await,
            None => Ok(()),
        }
    }

    fn block_loop_exhausted(&self, step: &StepRun, max_iterations: u32, detail: &str) -> Result<()> {
        let reason = BlockReason::LoopExhausted { max_iterations }.describe();
        let mut state = step.runtime_state.clone();
        state.last_error = Some(detail.to_string());
        self.set_step(step, StepUpdate::to(StepStatus::Blocked).runtime_state(state), "loop")?;
        self.store.append_event(
            NewEvent::step(
                event_types::LOOP_LIMIT_REACHED,
                step.protocol_run_id,
                step.id,
                format!("{} blocked: {}", step.step_name, reason),
            )
            .with_metadata(json!({ "max_iterations": max_iterations, "last_error": detail })),
        )?;
        self.block_protocol(step.protocol_run_id, &format!("{} {}", step.step_name, reason))
    }

    /// Block a running protocol; other states are left alone.
    fn block_protocol(&self, protocol_run_id: i64, reason: &str) -> Result<()> {
        let run = self.store.protocol_run(protocol_run_id)?;
        if run.status != ProtocolStatus::Running {
            log::info!("Protocol {} is {}; not blocking", run.id, run.status);
            return Ok(());
        }
        self.set_protocol(&run, ProtocolUpdate::to(ProtocolStatus::Blocked), "block")?;
        self.store.append_event(NewEvent::protocol(
            event_types::PROTOCOL_BLOCKED,
            run.id,
            format!("Blocked: {}", reason),
        ))?;
        log::warn!("Protocol {} blocked: {}", run.id, reason);
        Ok(())
    }

    /// Schedule trigger targets, inline while under the depth cap; returns how many were scheduled.
    async fn trigger(&self, source: &StepRun, targets: &[String], depth: u32, inline: bool) -> Result<usize> {
        let mode = if inline { "inline" } else { "enqueue" };
        self.store.append_event(
            NewEvent::step(
                event_types::TRIGGER_DECISION,
                source.protocol_run_id,
                source.id,
                format!("{} triggers {}", source.step_name, targets.join(", ")),
            )
            .with_metadata(json!({ "targets": targets, "depth": depth, "mode": mode })),
        )?;

        let wants_inline = source
            .policy
            .trigger
            .as_ref()
            .is_some_and(|t| t.mode == TriggerMode::Inline);
        if wants_inline && !inline {
            self.store.append_event(
                NewEvent::step(
                    event_types::TRIGGER_INLINE_DEPTH_EXCEEDED,
                    source.protocol_run_id,
                    source.id,
                    format!("Trigger depth {} is past the inline limit; enqueueing instead", depth),
                )
                .with_metadata(json!({ "depth": depth, "max_depth": self.config.max_inline_trigger_depth })),
            )?;
        }

        let steps = self.store.list_step_runs(source.protocol_run_id)?;
        let mut scheduled = 0;
        for name in targets {
            let Some(target) = steps.iter().find(|s| &s.step_name == name) else {
                log::warn!("Trigger target {} of {} is not a step of this protocol", name, source.step_name);
                self.store.append_event(
                    NewEvent::step(
                        event_types::TRIGGER_MISSING_TARGET,
                        source.protocol_run_id,
                        source.id,
                        format!("Trigger target {} is not a step of this protocol", name),
                    )
                    .with_metadata(json!({ "target": name })),
                )?;
                continue;
            };
            if target.status.is_terminal() || target.status.is_active() {
                self.skip_trigger(source, name, &format!("target is {}", target.status))?;
                continue;
            }

            let state = RuntimeState {
                trigger_depth: depth,
                triggered_by: Some(source.id),
                ..target.runtime_state.clone()
            };
            let running = match self.set_step(target, StepUpdate::to(StepStatus::Running).runtime_state(state), "trigger") {
                Ok(running) => running,
                Err(e) if e.is_conflict() => {
                    self.skip_trigger(source, name, &e.to_string())?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            scheduled += 1;

            if inline {
                self.store.append_event(NewEvent::step(
                    event_types::TRIGGER_EXECUTED_INLINE,
                    running.protocol_run_id,
                    running.id,
                    format!("Running {} inline at depth {}", running.step_name, depth),
                ))?;
                match self.dispatcher.execute(running.id).await {
                    Ok(outcome) => self.apply_dispatch(running.id, outcome).await?,
                    Err(e) if e.is_retryable() => {
                        log::warn!("Inline trigger of {} failed ({}); enqueueing", running.id, e);
                        self.enqueue_execution(&running).await?;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                self.store.append_event(NewEvent::step(
                    event_types::TRIGGER_ENQUEUED,
                    running.protocol_run_id,
                    running.id,
                    format!("Enqueued {} at depth {}", running.step_name, depth),
                ))?;
                self.enqueue_execution(&running).await?;
            }
        }
        Ok(scheduled)
    }

    fn skip_trigger(&self, source: &StepRun, target: &str, reason: &str) -> Result<()> {
        log::info!("Skipping trigger {} -> {}: {}", source.step_name, target, reason);
        self.store.append_event(
            NewEvent::step(
                event_types::TRIGGER_SKIPPED,
                source.protocol_run_id,
                source.id,
                format!("Skipped trigger target {}: {}", target, reason),
            )
            .with_metadata(json!({ "target": target })),
        )?;
        Ok(())
    }
}
