//! Declarative policy types attached to steps.
//!
//! Specs declare a list of `PolicyKind` entries per step; validation resolves
//! them once into a `StepPolicy`, which is what the decision function reads.

use serde::{Deserialize, Serialize};

/// Default inline depth a trigger policy may reach
pub const MAX_INLINE_TRIGGER_DEPTH: u32 = 3;

fn default_depth_cap() -> u32 {
    MAX_INLINE_TRIGGER_DEPTH
}

/// Category of a step failure, matched against loop skip-lists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The execution engine reported a failure
    Execution,
    /// The QA capability returned FAIL
    Qa,
    /// The build pipeline reported failure
    Ci,
    /// Token budget refused the prompt
    Budget,
}

impl FailureKind {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Qa => "qa",
            Self::Ci => "ci",
            Self::Budget => "budget",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What vouched for a successful step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuccessKind {
    /// Execution finished and QA was skipped or unavailable
    Execution,
    /// The QA capability returned PASS
    Qa,
    /// The build pipeline reported success
    Ci,
}

/// Outcome a loop or trigger entry can be restricted to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PolicyCondition {
    ExecCompleted,
    ExecFailed,
    QaPassed,
    QaFailed,
    CiPassed,
    CiFailed,
}

impl PolicyCondition {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecCompleted => "exec_completed",
            Self::ExecFailed => "exec_failed",
            Self::QaPassed => "qa_passed",
            Self::QaFailed => "qa_failed",
            Self::CiPassed => "ci_passed",
            Self::CiFailed => "ci_failed",
        }
    }

    /// Whether this condition names a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ExecFailed | Self::QaFailed | Self::CiFailed)
    }
}

impl std::fmt::Display for PolicyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How trigger targets are run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Run within the current execution context while depth allows
    #[default]
    Inline,
    /// Always go through the queue
    Enqueue,
}

/// Per-step policy entry as declared in a spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyKind {
    /// No explicit policy; the protocol's default loop policy applies
    None,
    /// Opt out of loop and trigger handling, including inherited defaults
    Skip,
    /// Reset steps to pending on failure, bounded by `max_iterations`
    Loop(LoopPolicy),
    /// (Re-)run other steps on success, or on a named failure
    Trigger(TriggerPolicy),
}

/// Loop behaviour: which failures reset which steps, and how often.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopPolicy {
    pub max_iterations: u32,
    /// Failure kinds that never consume an iteration
    #[serde(default)]
    pub skip_list: Vec<FailureKind>,
    /// How many earlier steps to reset along with the failing one
    #[serde(default)]
    pub step_back: u32,
    /// Steps a step-back reset leaves alone
    #[serde(default)]
    pub skip_steps: Vec<String>,
    /// Only loop on this outcome
    #[serde(default)]
    pub condition: Option<PolicyCondition>,
}

impl LoopPolicy {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            skip_list: Vec::new(),
            step_back: 0,
            skip_steps: Vec::new(),
            condition: None,
        }
    }

    pub fn skipping(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.skip_list = kinds.into_iter().collect();
        self
    }

    pub fn step_back(mut self, steps: u32, skip_steps: &[&str]) -> Self {
        self.step_back = steps;
        self.skip_steps = skip_steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn when(mut self, condition: PolicyCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Whether a failure of this kind may consume a loop iteration
    pub fn qualifies(&self, kind: FailureKind) -> bool {
        !self.skip_list.contains(&kind)
    }

    /// Whether a step-back reset leaves this step alone
    pub fn skips_step(&self, name: &str) -> bool {
        self.skip_steps.iter().any(|s| s == name)
    }

    /// First step index a loop of the step at `index` resets.
    ///
    /// `names` lists the protocol's step names by index. A target landing on
    /// a skipped step moves further back, never past the first step.
    pub fn reset_from(&self, index: u32, names: &[&str]) -> u32 {
        let skipped = |i: u32| names.get(i as usize).is_some_and(|name| self.skips_step(name));
        let mut target = index.saturating_sub(self.step_back);
        while target > 0 && target < index && skipped(target) {
            target -= 1;
        }
        target
    }
}

/// Trigger behaviour: which steps to (re-)run and how.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerPolicy {
    pub targets: Vec<String>,
    #[serde(default)]
    pub mode: TriggerMode,
    #[serde(default = "default_depth_cap")]
    pub depth_cap: u32,
    /// Fire only on this outcome; without one the trigger fires on success
    #[serde(default)]
    pub condition: Option<PolicyCondition>,
}

impl TriggerPolicy {
    pub fn new<S: Into<String>>(targets: impl IntoIterator<Item = S>) -> Self {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            mode: TriggerMode::Inline,
            depth_cap: MAX_INLINE_TRIGGER_DEPTH,
            condition: None,
        }
    }

    pub fn mode(mut self, mode: TriggerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn depth_cap(mut self, depth_cap: u32) -> Self {
        self.depth_cap = depth_cap;
        self
    }

    pub fn when(mut self, condition: PolicyCondition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// The policy the decision function evaluates for one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepPolicy {
    #[serde(default)]
    pub loop_policy: Option<LoopPolicy>,
    #[serde(default)]
    pub trigger: Option<TriggerPolicy>,
}

impl StepPolicy {
    /// Resolve declared entries against the protocol default loop policy.
    ///
    /// `Skip` wins over everything. Otherwise the last declared loop/trigger
    /// entry of each kind applies; with no loop entry the default is inherited.
    pub fn resolve(kinds: &[PolicyKind], default_loop: Option<&LoopPolicy>) -> Self {
        if kinds.iter().any(|k| matches!(k, PolicyKind::Skip)) {
            return Self::default();
        }

        let mut resolved = Self::default();
        for kind in kinds {
            match kind {
                PolicyKind::Loop(lp) => resolved.loop_policy = Some(lp.clone()),
                PolicyKind::Trigger(trigger) => resolved.trigger = Some(trigger.clone()),
                PolicyKind::None | PolicyKind::Skip => {}
            }
        }

        if resolved.loop_policy.is_none() {
            resolved.loop_policy = default_loop.cloned();
        }
        resolved
    }

    /// True when neither loop nor trigger behaviour applies
    pub fn is_empty(&self) -> bool {
        self.loop_policy.is_none() && self.trigger.is_none()
    }
}
