//! Execution dispatcher
//!
//! Routes a running StepRun to its engine, writes results back under the
//! status guard and applies the step's QA policy. Deciding what a failure
//! means is left to the orchestrator; the dispatcher only reports outcomes.

use serde_json::json;
use std::sync::Arc;

use crate::budget::{BudgetCheck, BudgetGuard};
use crate::config::DEFAULT_ENGINE_ID;
use crate::domain::{
    NewEvent, NewJob, Project, ProtocolRun, ProtocolStatus, QaPolicy, StepRun, StepStatus, StepUpdate, event_types,
};
use crate::engine::{
    EngineError, EngineRegistry, EngineRequest, QaCapability, QaContext, QaVerdict, determine_verdict,
};
use crate::error::{ProtoflowError, Result};
use crate::policy::{FailureKind, SuccessKind};
use crate::queue::JobQueue;
use crate::store::StateStore;

/// Event messages handed to QA as the prior log
const QA_LOG_LINES: usize = 10;

/// What a dispatch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The step reached `completed`, vouched for by execution alone or by QA
    Completed(SuccessKind),
    /// Executed; a QA job was enqueued or QA waits for a manual trigger
    AwaitingQa,
    /// Engine unavailable; the step waits in `needs_qa` with a stub summary
    Degraded,
    /// The step failed; the policy engine decides what happens next
    Failed { kind: FailureKind, message: String },
    /// Stale or duplicate delivery; nothing was written except an event
    Discarded { reason: String },
}

/// Dispatcher knobs taken from configuration.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub default_engine_id: String,
    /// `full` QA enqueues its job right after execution
    pub auto_qa_after_exec: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_engine_id: DEFAULT_ENGINE_ID.to_string(),
            auto_qa_after_exec: true,
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn JobQueue>,
    engines: EngineRegistry,
    qa: Option<Arc<dyn QaCapability>>,
    budget: BudgetGuard,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn JobQueue>,
        engines: EngineRegistry,
        qa: Option<Arc<dyn QaCapability>>,
        budget: BudgetGuard,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            queue,
            engines,
            qa,
            budget,
            settings,
        }
    }

    pub fn budget(&self) -> &BudgetGuard {
        &self.budget
    }

    /// Run the engine for a running step.
    ///
    /// A pending step, left behind a queued job by a loop reset, is claimed
    /// first under the status guard. Retryable engine failures are returned
    /// as errors so the queue retries the job; every other failure is
    /// reported as `DispatchOutcome::Failed`.
    pub async fn execute(&self, step_run_id: i64) -> Result<DispatchOutcome> {
        let step = self.store.step_run(step_run_id)?;
        let run = self.store.protocol_run(step.protocol_run_id)?;
        if run.status != ProtocolStatus::Running {
            return self.discard(&step, format!("protocol {} is {}", run.id, run.status));
        }
        let step = match step.status {
            StepStatus::Running => step,
            StepStatus::Pending => {
                match self
                    .store
                    .update_step(step.id, StepStatus::Pending, StepUpdate::to(StepStatus::Running))
                {
                    Ok(claimed) => claimed,
                    Err(e) if e.is_conflict() => return self.discard(&step, format!("claim rejected: {}", e)),
                    Err(e) => return Err(e),
                }
            }
            other => return self.discard(&step, format!("step is {}", other)),
        };

        let project = self.store.project(run.project_id)?;
        let engine_id = self.resolve_engine_id(&step, &run, &project);
        let prompt = build_prompt(&step, &run);

        let context = format!("step {} of {}", step.step_name, run.protocol_name);
        let used = if self.budget.tracks_protocol_usage() {
            self.store.protocol_token_usage(run.id)?
        } else {
            0
        };
        let estimated = match self.budget.check(run.id, used, &prompt, &context) {
            Ok(BudgetCheck::Within { estimated }) => estimated,
            Ok(BudgetCheck::Warned { estimated, message }) => {
                self.store
                    .append_event(NewEvent::step(event_types::BUDGET_WARNING, run.id, step.id, message))?;
                estimated
            }
            Err(ProtoflowError::BudgetExceeded(message)) => {
                return Ok(DispatchOutcome::Failed {
                    kind: FailureKind::Budget,
                    message,
                });
            }
            Err(e) => return Err(e),
        };

        self.store.append_event(
            NewEvent::step(
                event_types::STEP_STARTED,
                run.id,
                step.id,
                format!("Executing {} with engine {}", step.step_name, engine_id),
            )
            .with_metadata(json!({
                "engine_id": engine_id,
                "model": step.model,
                "estimated_tokens": estimated,
                "loop_count": step.runtime_state.loop_count,
            })),
        )?;

        let Some(engine) = self.engines.get(&engine_id) else {
            return self.degrade(&step, &engine_id, format!("engine '{}' is not registered", engine_id));
        };

        let request = EngineRequest {
            protocol_run_id: run.id,
            step_run_id: step.id,
            step_name: step.step_name.clone(),
            prompt,
            model: step.model.clone(),
            workdir: run.worktree_path.clone().or_else(|| run.protocol_root.clone()),
        };

        let output = match engine.execute(request).await {
            Ok(output) => output,
            Err(EngineError::Unavailable(message)) => return self.degrade(&step, &engine_id, message),
            Err(EngineError::Failure {
                message,
                retryable: true,
            }) => {
                log::warn!("Engine {} failed transiently on step {}: {}", engine_id, step.id, message);
                return Err(ProtoflowError::EngineFailure {
                    message,
                    retryable: true,
                });
            }
            Err(EngineError::Failure {
                message,
                retryable: false,
            }) => {
                return Ok(DispatchOutcome::Failed {
                    kind: FailureKind::Execution,
                    message,
                });
            }
        };

        // Recorded with the write-back, so a rejected result costs nothing
        let tokens = output.tokens_used.unwrap_or(estimated);
        let update = StepUpdate::to(StepStatus::NeedsQa)
            .summary(output.summary.clone())
            .artifacts(output.artifacts)
            .engine(engine_id.clone(), step.model.clone())
            .tokens(tokens);
        let executed = match self.store.update_step(step.id, StepStatus::Running, update) {
            Ok(executed) => executed,
            Err(e) if e.is_conflict() => return self.discard(&step, format!("write-back rejected: {}", e)),
            Err(e) => return Err(e),
        };

        self.store.append_event(
            NewEvent::step(event_types::STEP_EXECUTED, run.id, step.id, output.summary)
                .with_metadata(json!({ "engine_id": engine_id, "tokens": tokens })),
        )?;
        log::info!("Step {} executed by {}", step.id, engine_id);

        self.apply_qa_policy(executed).await
    }

    /// Ask the QA capability for a verdict on a step in `needs_qa`.
    pub async fn evaluate_qa(&self, step_run_id: i64) -> Result<DispatchOutcome> {
        let step = self.store.step_run(step_run_id)?;
        if step.status != StepStatus::NeedsQa {
            return self.discard(&step, format!("QA requested but step is {}", step.status));
        }
        let run = self.store.protocol_run(step.protocol_run_id)?;
        if run.status.is_terminal() || run.status == ProtocolStatus::Paused {
            return self.discard(&step, format!("protocol {} is {}", run.id, run.status));
        }

        let Some(qa) = &self.qa else {
            return self.complete(
                &step,
                SuccessKind::Execution,
                event_types::QA_UNAVAILABLE,
                "No QA capability configured; completing without QA".to_string(),
            );
        };

        let context = self.qa_context(&step, &run)?;
        let report = match qa.evaluate(&context).await {
            Ok(report) => report,
            Err(EngineError::Unavailable(message)) => {
                return self.complete(
                    &step,
                    SuccessKind::Execution,
                    event_types::QA_UNAVAILABLE,
                    format!("QA capability unavailable ({}); completing without QA", message),
                );
            }
            Err(EngineError::Failure {
                message,
                retryable: true,
            }) => {
                return Err(ProtoflowError::EngineFailure {
                    message,
                    retryable: true,
                });
            }
            Err(EngineError::Failure {
                message,
                retryable: false,
            }) => {
                self.store
                    .append_event(NewEvent::step(event_types::QA_FAILED, run.id, step.id, message.clone()))?;
                return Ok(DispatchOutcome::Failed {
                    kind: FailureKind::Qa,
                    message,
                });
            }
        };

        match determine_verdict(&report) {
            QaVerdict::Pass => {
                let outcome = self.complete(
                    &step,
                    SuccessKind::Qa,
                    event_types::QA_PASSED,
                    format!("QA passed for {}", step.step_name),
                )?;
                log::info!("QA passed for step {}", step.id);
                Ok(outcome)
            }
            QaVerdict::Fail => {
                self.store.append_event(
                    NewEvent::step(
                        event_types::QA_FAILED,
                        run.id,
                        step.id,
                        format!("QA failed for {}", step.step_name),
                    )
                    .with_metadata(json!({ "report": report })),
                )?;
                log::info!("QA failed for step {}", step.id);
                Ok(DispatchOutcome::Failed {
                    kind: FailureKind::Qa,
                    message: excerpt(&report),
                })
            }
        }
    }

    async fn apply_qa_policy(&self, step: StepRun) -> Result<DispatchOutcome> {
        match step.qa_policy {
            QaPolicy::Skip => self.complete(
                &step,
                SuccessKind::Execution,
                event_types::QA_SKIPPED,
                "QA skipped by policy".to_string(),
            ),
            QaPolicy::Light => self.evaluate_qa(step.id).await,
            QaPolicy::Full if self.settings.auto_qa_after_exec => {
                let job = NewJob::run_qa(&step);
                self.store.append_event(
                    NewEvent::step(
                        event_types::QA_ENQUEUED,
                        step.protocol_run_id,
                        step.id,
                        format!("QA enqueued for {}", step.step_name),
                    )
                    .with_metadata(json!({ "idempotency_key": job.idempotency_key })),
                )?;
                self.queue.enqueue(job).await?;
                Ok(DispatchOutcome::AwaitingQa)
            }
            QaPolicy::Full => Ok(DispatchOutcome::AwaitingQa),
        }
    }

    fn complete(&self, step: &StepRun, kind: SuccessKind, event_type: &str, message: String) -> Result<DispatchOutcome> {
        match self
            .store
            .update_step(step.id, StepStatus::NeedsQa, StepUpdate::to(StepStatus::Completed))
        {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return self.discard(step, format!("completion rejected: {}", e)),
            Err(e) => return Err(e),
        }
        self.store
            .append_event(NewEvent::step(event_type, step.protocol_run_id, step.id, message))?;
        Ok(DispatchOutcome::Completed(kind))
    }

    fn degrade(&self, step: &StepRun, engine_id: &str, reason: String) -> Result<DispatchOutcome> {
        let summary = format!(
            "[degraded] engine '{}' unavailable: {}. Output needs manual review.",
            engine_id, reason
        );
        match self.store.update_step(
            step.id,
            StepStatus::Running,
            StepUpdate::to(StepStatus::NeedsQa).summary(summary.clone()),
        ) {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return self.discard(step, format!("write-back rejected: {}", e)),
            Err(e) => return Err(e),
        }
        self.store.append_event(
            NewEvent::step(event_types::STEP_DEGRADED, step.protocol_run_id, step.id, summary)
                .with_metadata(json!({ "engine_id": engine_id })),
        )?;
        log::warn!("Step {} degraded: engine {} unavailable", step.id, engine_id);
        Ok(DispatchOutcome::Degraded)
    }

    fn discard(&self, step: &StepRun, reason: String) -> Result<DispatchOutcome> {
        log::info!("Discarding work for step {}: {}", step.id, reason);
        self.store.append_event(NewEvent::step(
            event_types::RESULT_DISCARDED,
            step.protocol_run_id,
            step.id,
            reason.clone(),
        ))?;
        Ok(DispatchOutcome::Discarded { reason })
    }

    /// Step, then spec default, then project default, then configuration
    fn resolve_engine_id(&self, step: &StepRun, run: &ProtocolRun, project: &Project) -> String {
        step.engine_id
            .clone()
            .or_else(|| run.spec.as_ref().and_then(|s| s.defaults.engine_id.clone()))
            .or_else(|| project.default_engine_id.clone())
            .unwrap_or_else(|| self.settings.default_engine_id.clone())
    }

    fn qa_context(&self, step: &StepRun, run: &ProtocolRun) -> Result<QaContext> {
        let events = self.store.list_events(Some(run.id))?;
        let prior_log = events
            .iter()
            .rev()
            .take(QA_LOG_LINES)
            .rev()
            .map(|e| format!("{}: {}", e.event_type, e.message))
            .collect();

        let diffs: Vec<&str> = step
            .artifacts
            .iter()
            .filter(|a| a.kind == "diff")
            .map(|a| a.content.as_str())
            .collect();
        let diff = if diffs.is_empty() {
            step.artifacts
                .iter()
                .map(|a| a.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            diffs.join("\n")
        };

        let instructions = run
            .spec
            .as_ref()
            .and_then(|spec| spec.steps.iter().find(|s| s.name == step.step_name))
            .and_then(|s| s.qa.prompt.clone());

        Ok(QaContext {
            protocol_name: run.protocol_name.clone(),
            plan: run.description.clone(),
            prior_log,
            diff,
            step_name: step.step_name.clone(),
            step_description: step.description.clone(),
            summary: step.summary.clone(),
            instructions,
        })
    }
}

fn build_prompt(step: &StepRun, run: &ProtocolRun) -> String {
    let mut prompt = step
        .prompt
        .clone()
        .or_else(|| step.description.clone())
        .unwrap_or_else(|| format!("Carry out step {} of protocol {}.", step.step_name, run.protocol_name));

    if let Some(error) = &step.runtime_state.last_error {
        prompt.push_str(&format!(
            "\n\nThe previous attempt (iteration {}) failed:\n{}\nAddress this before anything else.",
            step.runtime_state.loop_count, error
        ));
    }
    prompt
}

fn excerpt(text: &str) -> String {
    const MAX: usize = 500;
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        format!("{}...", trimmed.chars().take(MAX).collect::<String>())
    }
}
