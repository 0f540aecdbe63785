//! Reconciliation listener
//!
//! Maps CI callbacks onto step transitions. Every transition is a guarded
//! update, so a replayed callback finds the step already moved and reports
//! `NoOp` instead of applying twice.

pub mod signal;

pub use signal::{CiProvider, CiSignal, CiStatus, CiTarget, normalize_status};

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use crate::domain::{NewEvent, NewJob, ProtocolRun, QaPolicy, StepRun, StepStatus, StepUpdate, event_types};
use crate::error::{ProtoflowError, Result};
use crate::orchestrator::Orchestrator;
use crate::policy::{FailureKind, StepOutcome, SuccessKind};
use crate::store::StateStore;

/// What a callback did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// A transition was written
    Applied,
    /// Already in the state the callback implies
    NoOp,
    /// Recorded, but the callback does not apply to the step's state
    Ignored,
    /// A QA job was queued
    Enqueued,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::NoOp => "no_op",
            Self::Ignored => "ignored",
            Self::Enqueued => "enqueued",
        }
    }
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
    /// A CI pass on a step awaiting QA queues QA instead of completing it
    auto_qa_on_ci: bool,
}

impl Reconciler {
    pub fn new(orchestrator: Arc<Orchestrator>, auto_qa_on_ci: bool) -> Self {
        Self {
            orchestrator,
            auto_qa_on_ci,
        }
    }

    fn store(&self) -> &dyn StateStore {
        self.orchestrator.store().as_ref()
    }

    /// Apply one CI callback.
    ///
    /// An unknown run is recorded as a `reconciliation_mismatch` event and
    /// returned as `ReconciliationMismatch`; nothing else changes.
    pub async fn reconcile(&self, signal: &CiSignal) -> Result<ReconcileOutcome> {
        let run = self.resolve_run(signal)?;
        let Some(step) = self.resolve_step(signal, &run)? else {
            self.record(&run, None, event_types::CI_IGNORED, signal, "no step to apply it to")?;
            return Ok(ReconcileOutcome::Ignored);
        };

        let status = signal.normalized();
        log::info!(
            "CI {} signal '{}' ({}) for protocol {} step {} ({})",
            signal.provider,
            signal.status,
            status.as_str(),
            run.id,
            step.id,
            step.status
        );

        match status {
            CiStatus::Running => {
                self.record(&run, Some(&step), event_types::CI_RUNNING, signal, "CI running")?;
                Ok(ReconcileOutcome::NoOp)
            }
            CiStatus::Success => self.on_success(&run, step, signal).await,
            CiStatus::Failure => self.on_failure(&run, step, signal),
            CiStatus::Unrecognized => {
                self.record(&run, Some(&step), event_types::CI_IGNORED, signal, "unrecognized status")?;
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn on_success(&self, run: &ProtocolRun, step: StepRun, signal: &CiSignal) -> Result<ReconcileOutcome> {
        match step.status {
            StepStatus::NeedsQa if self.auto_qa_on_ci && step.qa_policy != QaPolicy::Skip => {
                let enqueued = self.orchestrator.queue().enqueue(NewJob::run_qa(&step)).await?;
                if enqueued.coalesced {
                    return Ok(ReconcileOutcome::NoOp);
                }
                self.record(run, Some(&step), event_types::QA_ENQUEUED, signal, "CI passed; QA enqueued")?;
                Ok(ReconcileOutcome::Enqueued)
            }
            StepStatus::NeedsQa => {
                self.complete(run, &step, signal).await?;
                Ok(ReconcileOutcome::Applied)
            }
            StepStatus::Running => {
                let needs_qa = self
                    .orchestrator
                    .set_step(&step, StepUpdate::to(StepStatus::NeedsQa), "ci_passed")?;
                self.complete(run, &needs_qa, signal).await?;
                Ok(ReconcileOutcome::Applied)
            }
            StepStatus::Completed => Ok(ReconcileOutcome::NoOp),
            _ => {
                self.record(run, Some(&step), event_types::CI_IGNORED, signal, "CI passed on an idle step")?;
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    fn on_failure(&self, run: &ProtocolRun, step: StepRun, signal: &CiSignal) -> Result<ReconcileOutcome> {
        match step.status {
            StepStatus::Running | StepStatus::NeedsQa => {
                let detail = format!("CI reported '{}' via {}", signal.status, signal.provider);
                self.orchestrator
                    .fail_and_block(&step, FailureKind::Ci, &detail, event_types::CI_FAILED)?;
                Ok(ReconcileOutcome::Applied)
            }
            StepStatus::Failed | StepStatus::Blocked => Ok(ReconcileOutcome::NoOp),
            _ => {
                self.record(run, Some(&step), event_types::CI_IGNORED, signal, "CI failed on an idle step")?;
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn complete(&self, run: &ProtocolRun, step: &StepRun, signal: &CiSignal) -> Result<()> {
        self.orchestrator
            .set_step(step, StepUpdate::to(StepStatus::Completed), "ci_passed")?;
        self.record(run, Some(step), event_types::CI_PASSED, signal, "CI passed")?;
        self.orchestrator
            .handle_step_outcome(step.id, StepOutcome::Success(SuccessKind::Ci), "ci passed".to_string())
            .await
    }

    fn resolve_run(&self, signal: &CiSignal) -> Result<ProtocolRun> {
        let found = match &signal.target {
            CiTarget::RunId(id) => self.store().get_protocol_run(*id)?,
            CiTarget::Branch(branch) => self.store().find_protocol_run_by_branch(branch)?,
        };
        match found {
            Some(run) => Ok(run),
            None => Err(self.mismatch(signal, format!("no active protocol run for {}", signal.target))),
        }
    }

    /// The explicit step, else the active one, else the most recently updated
    fn resolve_step(&self, signal: &CiSignal, run: &ProtocolRun) -> Result<Option<StepRun>> {
        match signal.step_run_id {
            Some(id) => match self.store().get_step_run(id)? {
                Some(step) if step.protocol_run_id == run.id => Ok(Some(step)),
                _ => Err(self.mismatch(signal, format!("step {} is not part of protocol {}", id, run.id))),
            },
            None => self.store().latest_step_run(run.id),
        }
    }

    fn mismatch(&self, signal: &CiSignal, message: String) -> ProtoflowError {
        log::warn!("Reconciliation mismatch: {}", message);
        let event = NewEvent::new(event_types::RECONCILIATION_MISMATCH, message.clone()).with_metadata(json!({
            "provider": signal.provider,
            "target": signal.target,
            "status": signal.status,
            "step_run_id": signal.step_run_id,
        }));
        if let Err(e) = self.store().append_event(event) {
            log::error!("Failed to record reconciliation mismatch: {}", e);
        }
        ProtoflowError::ReconciliationMismatch(message)
    }

    fn record(
        &self,
        run: &ProtocolRun,
        step: Option<&StepRun>,
        event_type: &str,
        signal: &CiSignal,
        message: &str,
    ) -> Result<()> {
        let mut event = NewEvent::protocol(
            event_type,
            run.id,
            format!("{} ({} '{}')", message, signal.provider, signal.status),
        )
        .with_metadata(json!({
            "provider": signal.provider,
            "status": signal.status,
            "normalized": signal.normalized().as_str(),
            "signal": signal.metadata,
        }));
        event.step_run_id = step.map(|s| s.id);
        self.store().append_event(event)?;
        Ok(())
    }
}
