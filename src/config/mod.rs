//! Configuration system for protoflow.
//!
//! A single YAML document with one section per concern. Every section has
//! defaults, so an empty or missing file is a valid configuration.
//!
//! Search order:
//! 1. Explicit path if provided
//! 2. ~/.config/protoflow/protoflow.yml (user config)
//! 3. ./protoflow.yml (project config)
//! 4. Default values

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::budget::{BudgetGuard, BudgetMode};
use crate::policy::MAX_INLINE_TRIGGER_DEPTH;

/// Engine id used when neither step, spec nor project names one.
pub const DEFAULT_ENGINE_ID: &str = "codex";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub orchestrator: OrchestratorConfig,
    pub budget: BudgetConfig,
    pub qa: QaConfig,
    /// External engines by id
    pub engines: HashMap<String, CommandConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("protoflow"),
        }
    }
}

/// Which queue backend carries jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Run jobs on the caller's task
    #[default]
    Inline,
    /// Persist jobs for a worker pool
    Durable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_secs: u64,
    pub poll_interval_ms: u64,
    /// A started job whose worker has not finished it within this long is claimable again
    pub lease_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Inline,
            workers: 2,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_cap_secs: 60,
            poll_interval_ms: 500,
            lease_secs: 300,
        }
    }
}

impl QueueConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OrchestratorConfig {
    pub max_inline_trigger_depth: u32,
    /// Schedule the next pending step when one completes
    pub auto_advance: bool,
    pub default_engine_id: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_inline_trigger_depth: MAX_INLINE_TRIGGER_DEPTH,
            auto_advance: true,
            default_engine_id: DEFAULT_ENGINE_ID.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BudgetConfig {
    pub mode: BudgetMode,
    pub max_tokens_per_step: Option<u64>,
    pub max_tokens_per_protocol: Option<u64>,
}

impl BudgetConfig {
    pub fn guard(&self) -> BudgetGuard {
        BudgetGuard::new(self.mode, self.max_tokens_per_step, self.max_tokens_per_protocol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QaConfig {
    /// A CI success on a QA-gated step enqueues QA instead of completing it
    pub auto_qa_on_ci: bool,
    /// `full` QA enqueues its job right after execution; otherwise it waits for `run_qa`
    pub auto_qa_after_exec: bool,
    /// External QA command; without one QA degrades to a pass-through
    pub command: Option<CommandConfig>,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            auto_qa_on_ci: false,
            auto_qa_after_exec: true,
            command: None,
        }
    }
}

/// An external program invoked with the prompt on stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    1800
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_name = env!("CARGO_PKG_NAME");

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.queue.workers == 0 {
            eyre::bail!("queue.workers must be > 0");
        }
        if self.queue.max_attempts == 0 {
            eyre::bail!("queue.max-attempts must be > 0");
        }
        if self.queue.backoff_cap_secs == 0 {
            eyre::bail!("queue.backoff-cap-secs must be > 0");
        }
        if self.orchestrator.default_engine_id.trim().is_empty() {
            eyre::bail!("orchestrator.default-engine-id must not be empty");
        }
        for (id, engine) in &self.engines {
            if engine.program.trim().is_empty() {
                eyre::bail!("engines.{}.program must not be empty", id);
            }
        }
        Ok(())
    }

    /// Path of the SQLite database under the data directory
    pub fn db_path(&self) -> PathBuf {
        self.storage.data_dir.join(crate::store::sqlite::DB_FILE)
    }
}
