//! Declarative protocol spec types.

use serde::{Deserialize, Serialize};

use crate::domain::{QaPolicy, StepType};
use crate::error::Result;
use crate::policy::{LoopPolicy, PolicyKind, StepPolicy};

/// A protocol spec as written by the user (YAML or JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProtocolSpec {
    #[serde(default)]
    pub defaults: SpecDefaults,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// Protocol-wide defaults each step may override.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpecDefaults {
    #[serde(default)]
    pub engine_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub qa_policy: Option<QaPolicy>,
    /// Loop policy inherited by steps that declare none
    #[serde(default, rename = "loop")]
    pub loop_policy: Option<LoopPolicy>,
}

/// One declared step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Prompt text handed to the engine
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub engine_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub step_type: Option<StepType>,
    #[serde(default)]
    pub qa: QaSpec,
    #[serde(default)]
    pub policies: Vec<PolicyKind>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_qa_policy(mut self, policy: QaPolicy) -> Self {
        self.qa.policy = Some(policy);
        self
    }

    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_engine(mut self, engine_id: impl Into<String>) -> Self {
        self.engine_id = Some(engine_id.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// Per-step QA configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QaSpec {
    #[serde(default)]
    pub policy: Option<QaPolicy>,
    /// Extra instructions for the QA capability
    #[serde(default)]
    pub prompt: Option<String>,
}

/// A validated spec: policies resolved once, steps in declared order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSpec {
    pub hash: String,
    pub steps: Vec<ResolvedStep>,
}

impl ResolvedSpec {
    pub fn step(&self, name: &str) -> Option<&ResolvedStep> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// A validated step ready to materialize as a StepRun.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStep {
    /// Position in declared order
    pub index: u32,
    pub name: String,
    pub step_type: StepType,
    pub engine_id: Option<String>,
    pub model: Option<String>,
    /// None falls back to the project default
    pub qa_policy: Option<QaPolicy>,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub policy: StepPolicy,
}

/// Parse a spec document. YAML is accepted, which covers JSON too.
pub fn parse_spec(text: &str) -> Result<ProtocolSpec> {
    Ok(serde_yaml::from_str(text)?)
}
