//! Materialize StepRuns from a resolved spec.

use std::collections::HashSet;

use crate::domain::{NewStepRun, QaPolicy};
use crate::error::{ProtoflowError, Result};
use crate::spec::model::ResolvedSpec;
use crate::store::StateStore;

/// Create a StepRun for every resolved step not yet present (matched by name).
///
/// `step_index` is the step's declared position. Existing rows are left as
/// they are, so re-planning an amended spec only adds the new steps. Returns
/// the number of rows created.
pub fn sync_step_runs(
    store: &dyn StateStore,
    protocol_run_id: i64,
    spec: &ResolvedSpec,
    default_qa_policy: QaPolicy,
) -> Result<usize> {
    let existing = store.list_step_runs(protocol_run_id)?;
    let names: HashSet<&str> = existing.iter().map(|s| s.step_name.as_str()).collect();
    let taken: HashSet<u32> = existing.iter().map(|s| s.step_index).collect();

    let mut created = 0;
    for step in &spec.steps {
        if names.contains(step.name.as_str()) {
            continue;
        }
        if taken.contains(&step.index) {
            return Err(ProtoflowError::Validation(vec![format!(
                "step '{}': index {} is already held by another step of this protocol",
                step.name, step.index
            )]));
        }

        store.create_step_run(NewStepRun {
            protocol_run_id,
            step_index: step.index,
            step_name: step.name.clone(),
            step_type: step.step_type,
            engine_id: step.engine_id.clone(),
            model: step.model.clone(),
            qa_policy: step.qa_policy.unwrap_or(default_qa_policy),
            description: step.description.clone(),
            prompt: step.prompt.clone(),
            policy: step.policy.clone(),
        })?;
        created += 1;
    }

    log::info!(
        "Synced {} new step run(s) for protocol {} (spec {})",
        created,
        protocol_run_id,
        spec.hash
    );
    Ok(created)
}
