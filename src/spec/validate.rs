//! Spec validation and hashing.
//!
//! Validation collects every violation before failing so the caller can fix
//! the spec in one pass. Nothing is materialized from an invalid spec.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::domain::infer_step_type;
use crate::error::{ProtoflowError, Result};
use crate::policy::{LoopPolicy, PolicyKind, StepPolicy};
use crate::spec::model::{ProtocolSpec, ResolvedSpec, ResolvedStep};

/// Validate a spec and resolve each step's policy once.
pub fn validate_spec(spec: &ProtocolSpec) -> Result<ResolvedSpec> {
    let mut errors = Vec::new();

    if spec.steps.is_empty() {
        errors.push("spec declares no steps".to_string());
    }

    let names: HashSet<&str> = spec.steps.iter().map(|s| s.name.as_str()).collect();

    if let Some(lp) = &spec.defaults.loop_policy {
        check_loop(lp, "defaults.loop", &names, &mut errors);
    }
    let mut seen = HashSet::new();

    for (index, step) in spec.steps.iter().enumerate() {
        let label = if step.name.trim().is_empty() {
            format!("steps[{}]", index)
        } else {
            format!("step '{}'", step.name)
        };

        if step.name.trim().is_empty() {
            errors.push(format!("{}: name must not be empty", label));
        } else if !seen.insert(step.name.as_str()) {
            errors.push(format!("{}: duplicate step name", label));
        }

        let mut loops = 0;
        let mut triggers = 0;
        for policy in &step.policies {
            match policy {
                PolicyKind::Loop(lp) => {
                    loops += 1;
                    check_loop(lp, &label, &names, &mut errors);
                    if lp.step_back as usize > index {
                        errors.push(format!(
                            "{}: loop step_back {} reaches before the first step",
                            label, lp.step_back
                        ));
                    }
                }
                PolicyKind::Trigger(trigger) => {
                    triggers += 1;
                    if trigger.targets.is_empty() {
                        errors.push(format!("{}: trigger policy has no targets", label));
                    }
                    if trigger.depth_cap == 0 {
                        errors.push(format!("{}: trigger depth_cap must be at least 1", label));
                    }
                    for target in &trigger.targets {
                        if target == &step.name {
                            errors.push(format!("{}: trigger may not target itself", label));
                        } else if !names.contains(target.as_str()) {
                            errors.push(format!("{}: trigger target '{}' is not a declared step", label, target));
                        }
                    }
                }
                PolicyKind::None | PolicyKind::Skip => {}
            }
        }
        if loops > 1 {
            errors.push(format!("{}: at most one loop policy is allowed", label));
        }
        if triggers > 1 {
            errors.push(format!("{}: at most one trigger policy is allowed", label));
        }
    }

    if !errors.is_empty() {
        return Err(ProtoflowError::Validation(errors));
    }

    let steps = spec
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| ResolvedStep {
            index: index as u32,
            name: step.name.clone(),
            step_type: step.step_type.unwrap_or_else(|| infer_step_type(&step.name)),
            engine_id: step.engine_id.clone().or_else(|| spec.defaults.engine_id.clone()),
            model: step.model.clone().or_else(|| spec.defaults.model.clone()),
            qa_policy: step.qa.policy.or(spec.defaults.qa_policy),
            description: step.description.clone(),
            prompt: step.prompt.clone(),
            policy: StepPolicy::resolve(&step.policies, spec.defaults.loop_policy.as_ref()),
        })
        .collect();

    Ok(ResolvedSpec {
        hash: spec_hash(spec)?,
        steps,
    })
}

/// Checks shared by step loops and the protocol default loop.
fn check_loop(lp: &LoopPolicy, label: &str, names: &HashSet<&str>, errors: &mut Vec<String>) {
    if lp.max_iterations == 0 {
        errors.push(format!("{}: max_iterations must be at least 1", label));
    }
    if let Some(condition) = lp.condition {
        if !condition.is_failure() {
            errors.push(format!("{}: loop condition '{}' is not a failure", label, condition));
        }
    }
    for name in &lp.skip_steps {
        if !names.contains(name.as_str()) {
            errors.push(format!("{}: skip_steps entry '{}' is not a declared step", label, name));
        }
    }
}

/// Stable short hash of a spec: first 12 hex chars of sha256 over canonical JSON.
pub fn spec_hash(spec: &ProtocolSpec) -> Result<String> {
    // serde_json maps are ordered, so the value's rendering is canonical
    let canonical = serde_json::to_string(&serde_json::to_value(spec)?)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(digest)[..12].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{QaPolicy, StepType};
    use crate::policy::{PolicyCondition, TriggerPolicy};
    use crate::spec::model::StepSpec;

    fn spec(steps: Vec<StepSpec>) -> ProtocolSpec {
        ProtocolSpec {
            steps,
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_spec_resolves_in_order() {
        let resolved = validate_spec(&spec(vec![
            StepSpec::new("00-setup"),
            StepSpec::new("01-build"),
            StepSpec::new("02-qa-review"),
        ]))
        .unwrap();

        let indices: Vec<u32> = resolved.steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(resolved.steps[0].step_type, StepType::Setup);
        assert_eq!(resolved.steps[1].step_type, StepType::Work);
        assert_eq!(resolved.steps[2].step_type, StepType::Qa);
        assert_eq!(resolved.hash.len(), 12);
    }

    #[test]
    fn test_empty_spec_rejected() {
        let err = validate_spec(&ProtocolSpec::default()).unwrap_err();
        assert!(matches!(err, ProtoflowError::Validation(ref v) if v.len() == 1));
    }

    #[test]
    fn test_all_violations_reported() {
        let steps = vec![
            StepSpec::new("a").with_policy(PolicyKind::Loop(LoopPolicy::new(0))),
            StepSpec::new("a"),
            StepSpec::new("b").with_policy(PolicyKind::Trigger(TriggerPolicy::new(["b", "missing"]))),
            StepSpec::new(""),
        ];
        let ProtoflowError::Validation(errors) = validate_spec(&spec(steps)).unwrap_err() else {
            panic!("expected validation error");
        };
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().any(|e| e.contains("max_iterations")));
        assert!(errors.iter().any(|e| e.contains("duplicate")));
        assert!(errors.iter().any(|e| e.contains("itself")));
        assert!(errors.iter().any(|e| e.contains("'missing'")));
        assert!(errors.iter().any(|e| e.contains("steps[3]")));
    }

    #[test]
    fn test_loop_step_back_checked() {
        let steps = vec![
            StepSpec::new("00-setup"),
            StepSpec::new("01-build").with_policy(PolicyKind::Loop(LoopPolicy::new(2).step_back(2, &["nope"]))),
            StepSpec::new("02-test").with_policy(PolicyKind::Loop(
                LoopPolicy::new(2)
                    .step_back(2, &["00-setup"])
                    .when(PolicyCondition::QaPassed),
            )),
        ];
        let ProtoflowError::Validation(errors) = validate_spec(&spec(steps)).unwrap_err() else {
            panic!("expected validation error");
        };
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("'01-build'") && e.contains("before the first step")));
        assert!(errors.iter().any(|e| e.contains("'nope'")));
        assert!(errors.iter().any(|e| e.contains("'qa_passed' is not a failure")));
    }

    #[test]
    fn test_step_back_within_range_resolves() {
        let steps = vec![
            StepSpec::new("00-setup"),
            StepSpec::new("01-build"),
            StepSpec::new("02-test").with_policy(PolicyKind::Loop(
                LoopPolicy::new(2)
                    .step_back(2, &["00-setup"])
                    .when(PolicyCondition::QaFailed),
            )),
        ];
        let resolved = validate_spec(&spec(steps)).unwrap();
        let lp = resolved.step("02-test").unwrap().policy.loop_policy.clone().unwrap();
        assert_eq!(lp.step_back, 2);
        assert_eq!(lp.skip_steps, vec!["00-setup".to_string()]);
    }

    #[test]
    fn test_defaults_flow_into_steps() {
        let mut s = spec(vec![
            StepSpec::new("one"),
            StepSpec::new("two")
                .with_engine("claude")
                .with_qa_policy(QaPolicy::Light)
                .with_policy(PolicyKind::Skip),
        ]);
        s.defaults.engine_id = Some("codex".into());
        s.defaults.qa_policy = Some(QaPolicy::Skip);
        s.defaults.loop_policy = Some(LoopPolicy::new(2));

        let resolved = validate_spec(&s).unwrap();
        let one = resolved.step("one").unwrap();
        assert_eq!(one.engine_id.as_deref(), Some("codex"));
        assert_eq!(one.qa_policy, Some(QaPolicy::Skip));
        assert_eq!(one.policy.loop_policy.as_ref().unwrap().max_iterations, 2);

        let two = resolved.step("two").unwrap();
        assert_eq!(two.engine_id.as_deref(), Some("claude"));
        assert_eq!(two.qa_policy, Some(QaPolicy::Light));
        assert!(two.policy.is_empty());
    }

    #[test]
    fn test_spec_hash_is_stable_and_content_sensitive() {
        let a = spec(vec![StepSpec::new("one")]);
        let b = spec(vec![StepSpec::new("one")]);
        let c = spec(vec![StepSpec::new("two")]);
        assert_eq!(spec_hash(&a).unwrap(), spec_hash(&b).unwrap());
        assert_ne!(spec_hash(&a).unwrap(), spec_hash(&c).unwrap());
    }
}
