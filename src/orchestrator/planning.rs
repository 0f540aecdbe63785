//! Planning job: validate the spec and materialize step runs.

use serde_json::json;

use crate::domain::{NewEvent, ProtocolRun, ProtocolStatus, ProtocolUpdate, event_types};
use crate::error::{ProtoflowError, Result};
use crate::orchestrator::Orchestrator;
use crate::spec::{ProtocolSpec, SpecDefaults, build_spec_from_files, sync_step_runs, validate_spec};

impl Orchestrator {
    /// Run the planning job for a protocol in `planning`.
    ///
    /// A malformed spec blocks the protocol with a `spec_validation_error`
    /// event listing every violation; the job itself still succeeds.
    pub(crate) async fn plan_protocol(&self, protocol_run_id: i64) -> Result<()> {
        let run = self.store.protocol_run(protocol_run_id)?;
        if run.status != ProtocolStatus::Planning {
            log::info!(
                "Skipping planning for protocol {}: status is {}",
                run.id,
                run.status
            );
            return Ok(());
        }

        let spec = self.load_spec(&run)?;
        let resolved = match validate_spec(&spec) {
            Ok(resolved) => resolved,
            Err(ProtoflowError::Validation(errors)) => return self.block_invalid_spec(&run, errors),
            Err(e) => return Err(e),
        };

        let project = self.store.project(run.project_id)?;
        match sync_step_runs(self.store.as_ref(), run.id, &resolved, project.default_qa_policy) {
            Ok(_) => {}
            Err(ProtoflowError::Validation(errors)) => return self.block_invalid_spec(&run, errors),
            Err(e) => return Err(e),
        }

        let hash = resolved.hash.clone();
        let step_count = resolved.steps.len();
        let planned = self.set_protocol(
            &run,
            ProtocolUpdate::to(ProtocolStatus::Planned).spec(spec, hash.clone()),
            "plan",
        )?;
        self.store.append_event(
            NewEvent::protocol(
                event_types::PLANNED,
                run.id,
                format!("Planned {} step(s)", step_count),
            )
            .with_metadata(json!({ "spec_hash": hash, "steps": step_count })),
        )?;
        log::info!("Protocol {} planned with {} step(s)", run.id, step_count);

        if self.config.auto_advance {
            if let Err(e) = self.run_next_step(planned.id, Some(ProtocolStatus::Planned)).await {
                log::warn!("Protocol {} planned but could not start: {}", planned.id, e);
            }
        }
        Ok(())
    }

    /// Block a protocol whose planning job ran out of attempts.
    pub(crate) fn planning_failed(&self, protocol_run_id: i64, reason: &str) -> Result<()> {
        let run = self.store.protocol_run(protocol_run_id)?;
        if run.status != ProtocolStatus::Planning {
            return Ok(());
        }
        self.set_protocol(&run, ProtocolUpdate::to(ProtocolStatus::Blocked), "plan")?;
        self.store.append_event(NewEvent::protocol(
            event_types::PROTOCOL_BLOCKED,
            run.id,
            format!("Planning failed: {}", reason),
        ))?;
        Ok(())
    }

    /// The embedded spec, else one built from the protocol root's step files
    fn load_spec(&self, run: &ProtocolRun) -> Result<ProtocolSpec> {
        if let Some(spec) = &run.spec {
            return Ok(spec.clone());
        }
        match &run.protocol_root {
            Some(root) => build_spec_from_files(root, SpecDefaults::default()),
            None => Ok(ProtocolSpec::default()),
        }
    }

    fn block_invalid_spec(&self, run: &ProtocolRun, errors: Vec<String>) -> Result<()> {
        log::warn!("Spec for protocol {} is invalid: {}", run.id, errors.join("; "));
        self.store.append_event(
            NewEvent::protocol(
                event_types::SPEC_VALIDATION_ERROR,
                run.id,
                format!("Spec validation failed: {}", errors.join("; ")),
            )
            .with_metadata(json!({ "errors": errors })),
        )?;
        self.set_protocol(run, ProtocolUpdate::to(ProtocolStatus::Blocked), "plan")?;
        Ok(())
    }
}
