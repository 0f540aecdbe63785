//! Policy engine
//!
//! This module provides:
//! - `PolicyKind`: per-step policy entries as declared in a protocol spec
//! - `StepPolicy`: the resolved loop/trigger behaviour of one step
//! - `decide`: the pure decision function (advance, loop, trigger, block)
//! - `PolicyCondition`: outcomes a loop or trigger entry can be restricted to

pub mod decide;
pub mod kind;

pub use decide::{BlockReason, ConditionSkip, Decision, Evaluation, StepOutcome, decide, evaluate};
pub use kind::{
    FailureKind, LoopPolicy, MAX_INLINE_TRIGGER_DEPTH, PolicyCondition, PolicyKind, StepPolicy, SuccessKind,
    TriggerMode, TriggerPolicy,
};
