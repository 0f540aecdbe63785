//! Engines backed by an external command.
//!
//! The prompt is written to the child's stdin; stdout becomes the summary and
//! a log artifact. A binary that cannot be spawned reports `Unavailable`.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::CommandConfig;
use crate::domain::Artifact;
use crate::engine::{Engine, EngineError, EngineOutput, EngineRequest, QaCapability, QaContext};

const SUMMARY_CHARS: usize = 2_000;

/// Execution engine that shells out to a configured program.
pub struct CommandEngine {
    id: String,
    command: CommandConfig,
}

impl CommandEngine {
    pub fn new(id: impl Into<String>, command: CommandConfig) -> Self {
        Self { id: id.into(), command }
    }
}

#[async_trait]
impl Engine for CommandEngine {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, request: EngineRequest) -> Result<EngineOutput, EngineError> {
        let mut extra = Vec::new();
        if let Some(model) = &request.model {
            extra.push(("PROTOFLOW_MODEL", model.clone()));
        }
        extra.push(("PROTOFLOW_STEP", request.step_name.clone()));

        let stdout = run_command(&self.command, &request.prompt, request.workdir.as_deref(), &extra).await?;
        Ok(EngineOutput {
            summary: summarize(&stdout),
            artifacts: vec![Artifact::new("stdout", "log", stdout)],
            tokens_used: None,
        })
    }
}

/// QA capability that shells out to a configured program.
pub struct CommandQa {
    command: CommandConfig,
    workdir: Option<PathBuf>,
}

impl CommandQa {
    pub fn new(command: CommandConfig) -> Self {
        Self { command, workdir: None }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

#[async_trait]
impl QaCapability for CommandQa {
    fn id(&self) -> &str {
        &self.command.program
    }

    async fn evaluate(&self, context: &QaContext) -> Result<String, EngineError> {
        let extra = [("PROTOFLOW_STEP", context.step_name.clone())];
        run_command(&self.command, &context.render(), self.workdir.as_deref(), &extra).await
    }
}

async fn run_command(
    command: &CommandConfig,
    input: &str,
    workdir: Option<&Path>,
    env: &[(&str, String)],
) -> Result<String, EngineError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => {
            EngineError::Unavailable(format!("cannot run '{}': {}", command.program, e))
        }
        _ => EngineError::failure(format!("failed to spawn '{}': {}", command.program, e), true),
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        // A child that exits without reading its input is judged by its exit status
        if let Err(e) = stdin.write_all(input.as_bytes()).await {
            if e.kind() != ErrorKind::BrokenPipe {
                return Err(EngineError::failure(format!("failed to write prompt: {}", e), true));
            }
        }
    }

    let timeout = Duration::from_secs(command.timeout_secs);
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| EngineError::failure(format!("'{}' timed out after {:?}", command.program, timeout), true))?
        .map_err(|e| EngineError::failure(format!("'{}' failed: {}", command.program, e), true))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = if stderr.trim().is_empty() { stdout.as_str() } else { &*stderr };
    Err(EngineError::failure(
        format!(
            "'{}' exited with {}: {}",
            command.program,
            output.status,
            summarize(detail)
        ),
        false,
    ))
}

/// Trailing slice of the output, where tools usually put their conclusion.
fn summarize(text: &str) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= SUMMARY_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - SUMMARY_CHARS).collect();
    format!("...{}", tail)
}
