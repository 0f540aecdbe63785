//! StepRun records: one ordered unit of work inside a protocol run.

use serde::{Deserialize, Serialize};

use crate::domain::status::StepStatus;
use crate::id::now_ms;
use crate::policy::StepPolicy;

/// Coarse step category, used for display and prompt selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Setup,
    #[default]
    Work,
    Qa,
}

impl StepType {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Work => "work",
            Self::Qa => "qa",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// When and how the QA capability is consulted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QaPolicy {
    /// Complete right after execution, never call QA
    Skip,
    /// Run QA inside the execution job
    Light,
    /// Enqueue a separate QA job
    #[default]
    Full,
}

impl QaPolicy {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Light => "light",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for QaPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QaPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "light" => Ok(Self::Light),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown QA policy '{}'", other)),
        }
    }
}

/// Typed counters the policy engine reads and the orchestrator writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeState {
    /// Loop resets consumed so far; only a manual retry clears it
    #[serde(default)]
    pub loop_count: u32,
    /// Inline trigger chain depth that scheduled this run
    #[serde(default)]
    pub trigger_depth: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Step that triggered this run, if any
    #[serde(default)]
    pub triggered_by: Option<i64>,
}

/// Output item produced by an engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    /// e.g. "diff", "file", "log"
    pub kind: String,
    #[serde(default)]
    pub content: String,
}

impl Artifact {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            content: content.into(),
        }
    }
}

/// A persisted step run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRun {
    pub id: i64,
    pub protocol_run_id: i64,
    /// Unique within the protocol; defines execution order
    pub step_index: u32,
    pub step_name: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub retries: u32,
    pub engine_id: Option<String>,
    pub model: Option<String>,
    pub qa_policy: QaPolicy,
    pub description: Option<String>,
    /// Prompt text or reference handed to the engine
    pub prompt: Option<String>,
    pub policy: StepPolicy,
    pub runtime_state: RuntimeState,
    pub summary: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Bumped on every persisted change
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields needed to materialize a step run.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStepRun {
    pub protocol_run_id: i64,
    pub step_index: u32,
    pub step_name: String,
    pub step_type: StepType,
    pub engine_id: Option<String>,
    pub model: Option<String>,
    pub qa_policy: QaPolicy,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub policy: StepPolicy,
}

impl NewStepRun {
    /// Build the initial pending record (id assigned by the store).
    pub fn into_record(self, id: i64) -> StepRun {
        let now = now_ms();
        StepRun {
            id,
            protocol_run_id: self.protocol_run_id,
            step_index: self.step_index,
            step_name: self.step_name,
            step_type: self.step_type,
            status: StepStatus::Pending,
            retries: 0,
            engine_id: self.engine_id,
            model: self.model,
            qa_policy: self.qa_policy,
            description: self.description,
            prompt: self.prompt,
            policy: self.policy,
            runtime_state: RuntimeState::default(),
            summary: None,
            artifacts: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied under an expected-status guard.
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub status: Option<StepStatus>,
    pub summary: Option<String>,
    pub artifacts: Option<Vec<Artifact>>,
    pub runtime_state: Option<RuntimeState>,
    pub retries: Option<u32>,
    pub engine_id: Option<String>,
    pub model: Option<String>,
    /// Tokens to add to the protocol's usage; not part of the step record
    pub tokens_used: Option<u64>,
}

impl StepUpdate {
    /// Start an update that moves the step to `status`
    pub fn to(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn runtime_state(mut self, state: RuntimeState) -> Self {
        self.runtime_state = Some(state);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn engine(mut self, engine_id: impl Into<String>, model: Option<String>) -> Self {
        self.engine_id = Some(engine_id.into());
        self.model = model;
        self
    }

    pub fn tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }

    /// Apply to a record in memory; the store persists the result.
    pub fn apply(self, step: &mut StepRun) {
        if let Some(status) = self.status {
            step.status = status;
        }
        if let Some(summary) = self.summary {
            step.summary = Some(summary);
        }
        if let Some(artifacts) = self.artifacts {
            step.artifacts = artifacts;
        }
        if let Some(state) = self.runtime_state {
            step.runtime_state = state;
        }
        if let Some(retries) = self.retries {
            step.retries = retries;
        }
        if let Some(engine_id) = self.engine_id {
            step.engine_id = Some(engine_id);
        }
        if let Some(model) = self.model {
            step.model = Some(model);
        }
        step.version += 1;
        step.updated_at = now_ms();
    }
}

/// Infer a step type from its file-style name.
///
/// `00-` prefixes and names mentioning "setup" are setup steps; names
/// mentioning "qa" are QA steps; everything else is work.
pub fn infer_step_type(name: &str) -> StepType {
    let lower = name.to_lowercase();
    if lower.starts_with("00-") || lower.contains("setup") {
        StepType::Setup
    } else if lower.contains("qa") {
        StepType::Qa
    } else {
        StepType::Work
    }
}
