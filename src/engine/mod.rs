//! Execution and QA capabilities
//!
//! Engines are pluggable: anything implementing `Engine` can be registered in
//! an `EngineRegistry` under its id. The QA capability is a separate trait
//! whose free-form report is reduced to a verdict by `determine_verdict`.

pub mod command;
pub mod mock;

pub use command::{CommandEngine, CommandQa};
pub use mock::{ScriptedEngine, ScriptedQa};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::domain::Artifact;
use crate::error::ProtoflowError;

/// Everything an engine needs for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub protocol_run_id: i64,
    pub step_run_id: i64,
    pub step_name: String,
    pub prompt: String,
    pub model: Option<String>,
    /// Directory the engine should work in, when the protocol has one
    pub workdir: Option<PathBuf>,
}

/// What an engine produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    pub summary: String,
    pub artifacts: Vec<Artifact>,
    /// Reported usage; the prompt estimate is recorded when absent
    pub tokens_used: Option<u64>,
}

impl EngineOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

/// Errors a capability can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The capability could not be reached at all
    #[error("{0}")]
    Unavailable(String),

    /// The capability ran and failed
    #[error("{message}")]
    Failure { message: String, retryable: bool },
}

impl EngineError {
    pub fn failure(message: impl Into<String>, retryable: bool) -> Self {
        Self::Failure {
            message: message.into(),
            retryable,
        }
    }
}

impl From<EngineError> for ProtoflowError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Unavailable(message) => ProtoflowError::EngineUnavailable(message),
            EngineError::Failure { message, retryable } => ProtoflowError::EngineFailure { message, retryable },
        }
    }
}

/// Performs a step's work given a prompt.
#[async_trait]
pub trait Engine: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(&self, request: EngineRequest) -> Result<EngineOutput, EngineError>;
}

/// Input assembled for a QA evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QaContext {
    pub protocol_name: String,
    /// Protocol description or plan
    pub plan: Option<String>,
    /// Recent event messages, oldest first
    pub prior_log: Vec<String>,
    /// Diff-like artifacts produced by the step
    pub diff: String,
    pub step_name: String,
    pub step_description: Option<String>,
    pub summary: Option<String>,
    /// Extra QA instructions from the spec
    pub instructions: Option<String>,
}

impl QaContext {
    /// Render as a single prompt for text-based QA capabilities.
    pub fn render(&self) -> String {
        let mut out = format!("# QA review: {} / {}\n\n", self.protocol_name, self.step_name);
        if let Some(plan) = &self.plan {
            out.push_str(&format!("## Plan\n{}\n\n", plan));
        }
        if let Some(description) = &self.step_description {
            out.push_str(&format!("## Step\n{}\n\n", description));
        }
        if let Some(summary) = &self.summary {
            out.push_str(&format!("## Execution summary\n{}\n\n", summary));
        }
        if !self.diff.is_empty() {
            out.push_str(&format!("## Changes\n{}\n\n", self.diff));
        }
        if !self.prior_log.is_empty() {
            out.push_str("## Recent log\n");
            for line in &self.prior_log {
                out.push_str(&format!("- {}\n", line));
            }
            out.push('\n');
        }
        if let Some(instructions) = &self.instructions {
            out.push_str(&format!("## Instructions\n{}\n\n", instructions));
        }
        out.push_str("End your report with a line `VERDICT: PASS` or `VERDICT: FAIL`.\n");
        out
    }
}

/// Produces a QA report for a step.
#[async_trait]
pub trait QaCapability: Send + Sync {
    fn id(&self) -> &str;

    /// Return the free-form report; the verdict is parsed from it.
    async fn evaluate(&self, context: &QaContext) -> Result<String, EngineError>;
}

/// QA outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaVerdict {
    Pass,
    Fail,
}

impl QaVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

/// Reduce a QA report to a verdict.
///
/// Only an explicit `VERDICT` line counts; a missing line, or one that
/// mentions FAIL or lacks PASS, is a failure.
pub fn determine_verdict(report: &str) -> QaVerdict {
    let line = report
        .lines()
        .rev()
        .map(|l| l.trim().trim_start_matches(['#', '*', '-', ' ']).to_uppercase())
        .find(|l| l.starts_with("VERDICT"));

    match line {
        Some(line) if line.contains("PASS") && !line.contains("FAIL") => QaVerdict::Pass,
        _ => QaVerdict::Fail,
    }
}

/// Engines keyed by id.
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn Engine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register command engines for every `engines` entry in the config
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (id, spec) in &config.engines {
            registry.register(Arc::new(CommandEngine::new(id.clone(), spec.clone())));
        }
        registry
    }

    /// Add or replace an engine under its own id
    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        self.engines.insert(engine.id().to_string(), engine);
    }

    pub fn with(mut self, engine: Arc<dyn Engine>) -> Self {
        self.register(engine);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Engine>> {
        self.engines.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.engines.contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry").field("engines", &self.ids()).finish()
    }
}
