//! The policy decision function.
//!
//! `decide` is pure: the same (outcome, policy, runtime state, depth cap)
//! always yields the same decision, so a crash between deciding and applying
//! can be replayed safely.

use crate::domain::RuntimeState;
use crate::policy::kind::{FailureKind, PolicyCondition, StepPolicy, SuccessKind, TriggerMode, TriggerPolicy};

/// What a step run produced, as seen by the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Success(SuccessKind),
    Failure(FailureKind),
}

impl StepOutcome {
    /// The condition policies match this outcome against
    pub fn condition(&self) -> PolicyCondition {
        match self {
            Self::Success(SuccessKind::Execution) => PolicyCondition::ExecCompleted,
            Self::Success(SuccessKind::Qa) => PolicyCondition::QaPassed,
            Self::Success(SuccessKind::Ci) => PolicyCondition::CiPassed,
            Self::Failure(FailureKind::Execution | FailureKind::Budget) => PolicyCondition::ExecFailed,
            Self::Failure(FailureKind::Qa) => PolicyCondition::QaFailed,
            Self::Failure(FailureKind::Ci) => PolicyCondition::CiFailed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Why a step was blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// The loop bound was reached
    LoopExhausted { max_iterations: u32 },
    /// No loop policy covers this failure
    Unhandled { kind: FailureKind },
}

impl BlockReason {
    /// Human-readable reason recorded on the blocking event
    pub fn describe(&self) -> String {
        match self {
            Self::LoopExhausted { max_iterations } => {
                format!("loop limit reached after {} iteration(s)", max_iterations)
            }
            Self::Unhandled { kind } => format!("{} failure with no applicable loop policy", kind),
        }
    }
}

/// The policy engine's verdict for one outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Move on to the next step
    Advance,
    /// Reset the step (and any step-back range) to pending with the new loop count
    Loop { loop_count: u32 },
    /// (Re-)run the named steps at `depth`; `inline` is false once depth passes the cap
    Trigger {
        targets: Vec<String>,
        depth: u32,
        inline: bool,
    },
    /// Stop the step and protocol until a user acts
    Block { reason: BlockReason },
}

/// A policy whose condition kept it from applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionSkip {
    Loop(PolicyCondition),
    Trigger(PolicyCondition),
}

/// A decision plus the conditional policies that were passed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    pub skipped: Vec<ConditionSkip>,
}

/// Decide what happens after a step outcome.
pub fn decide(outcome: StepOutcome, policy: &StepPolicy, state: &RuntimeState, max_inline_depth: u32) -> Decision {
    evaluate(outcome, policy, state, max_inline_depth).decision
}

/// `decide`, also reporting policies skipped because their condition did not match.
///
/// Success fires an unconditional trigger. A failure loops when the loop
/// policy applies; otherwise a trigger whose condition names the failure
/// fires, and with neither the step blocks.
pub fn evaluate(outcome: StepOutcome, policy: &StepPolicy, state: &RuntimeState, max_inline_depth: u32) -> Evaluation {
    let condition = outcome.condition();
    let mut skipped = Vec::new();

    let decision = match outcome {
        StepOutcome::Success(_) => match trigger_for(policy, condition, &mut skipped) {
            Some(trigger) => trigger_decision(trigger, state, max_inline_depth),
            None => Decision::Advance,
        },
        StepOutcome::Failure(kind) => {
            let loop_policy = policy.loop_policy.as_ref().filter(|lp| match lp.condition {
                Some(expected) if expected != condition => {
                    skipped.push(ConditionSkip::Loop(expected));
                    false
                }
                _ => true,
            });
            match loop_policy {
                // The bound is absolute, whatever the failure kind
                Some(lp) if state.loop_count >= lp.max_iterations => Decision::Block {
                    reason: BlockReason::LoopExhausted {
                        max_iterations: lp.max_iterations,
                    },
                },
                Some(lp) if lp.qualifies(kind) => Decision::Loop {
                    loop_count: state.loop_count + 1,
                },
                _ => match trigger_for(policy, condition, &mut skipped) {
                    Some(trigger) => trigger_decision(trigger, state, max_inline_depth),
                    None => Decision::Block {
                        reason: BlockReason::Unhandled { kind },
                    },
                },
            }
        }
    };

    Evaluation { decision, skipped }
}

/// The trigger that fires for `condition`; unconditional triggers fire on success only.
fn trigger_for<'a>(
    policy: &'a StepPolicy,
    condition: PolicyCondition,
    skipped: &mut Vec<ConditionSkip>,
) -> Option<&'a TriggerPolicy> {
    let trigger = policy.trigger.as_ref().filter(|t| !t.targets.is_empty())?;
    match trigger.condition {
        Some(expected) if expected == condition => Some(trigger),
        Some(expected) => {
            skipped.push(ConditionSkip::Trigger(expected));
            None
        }
        None if condition.is_failure() => None,
        None => Some(trigger),
    }
}

fn trigger_decision(trigger: &TriggerPolicy, state: &RuntimeState, max_inline_depth: u32) -> Decision {
    let depth = state.trigger_depth + 1;
    let cap = trigger.depth_cap.min(max_inline_depth);
    Decision::Trigger {
        targets: trigger.targets.clone(),
        depth,
        inline: trigger.mode == TriggerMode::Inline && depth <= cap,
    }
}
