//! Job records: units of work submitted to a queue backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::domain::{ProtocolRun, StepRun};
use crate::id::{generate_job_id, now_ms};

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Validate the spec and materialize step runs
    PlanProtocol,
    /// Invoke the execution engine for a step
    ExecuteStep,
    /// Invoke the QA capability for a step
    RunQa,
}

impl JobType {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanProtocol => "plan_protocol",
            Self::ExecuteStep => "execute_step",
            Self::RunQa => "run_qa",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan_protocol" => Ok(Self::PlanProtocol),
            "execute_step" => Ok(Self::ExecuteStep),
            "run_qa" => Ok(Self::RunQa),
            other => Err(format!("unknown job type '{}'", other)),
        }
    }
}

/// Visible job states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    /// Check if this status represents a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Check if this status represents a successful completion
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Check if this status represents a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "started" => Ok(Self::Started),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub target_id: i64,
    /// Duplicate submissions with the same key are coalesced
    pub idempotency_key: String,
    /// Handler invocations so far
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: Value,
    pub status: JobStatus,
    pub last_error: Option<String>,
    /// Not claimable before this Unix ms timestamp; while started, the lease expiry
    pub run_after: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    /// Protocol run this job belongs to, if recorded in the payload
    pub fn protocol_run_id(&self) -> Option<i64> {
        self.payload.get("protocol_run_id").and_then(Value::as_i64)
    }

    /// Mark job as picked up by a handler holding it until `lease_until`
    pub fn mark_started(&mut self, lease_until: i64) {
        self.status = JobStatus::Started;
        self.attempt += 1;
        self.run_after = lease_until;
        self.updated_at = now_ms();
    }

    /// Whether a started job's lease ran out before it finished
    pub fn lease_expired(&self, now: i64) -> bool {
        self.status == JobStatus::Started && self.run_after <= now
    }

    /// Return an interrupted job to the queue, due immediately
    pub fn mark_requeued(&mut self, reason: &str) {
        self.status = JobStatus::Queued;
        self.last_error = Some(reason.to_string());
        self.run_after = now_ms();
        self.updated_at = self.run_after;
    }

    /// Mark job as successfully completed
    pub fn mark_finished(&mut self) {
        self.status = JobStatus::Finished;
        self.last_error = None;
        self.updated_at = now_ms();
    }

    /// Put the job back in the queue after a retryable failure
    pub fn mark_retry(&mut self, error: &str, run_after: i64) {
        self.status = JobStatus::Queued;
        self.last_error = Some(error.to_string());
        self.run_after = run_after;
        self.updated_at = now_ms();
    }

    /// Mark job as terminally failed
    pub fn mark_failed(&mut self, error: &str) {
        self.status = JobStatus::Failed;
        self.last_error = Some(error.to_string());
        self.updated_at = now_ms();
    }

    /// Whether another attempt is allowed after the current one
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// A job submission.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: JobType,
    pub target_id: i64,
    pub idempotency_key: String,
    pub payload: Value,
}

impl NewJob {
    /// Submission keyed by `{job_type}:{target}:v{version}`.
    ///
    /// The version is the entity's version after the transition that scheduled
    /// the work, so a loop reset gets a fresh key and a replay does not.
    pub fn new(job_type: JobType, target_id: i64, version: u64, protocol_run_id: i64) -> Self {
        Self {
            job_type,
            target_id,
            idempotency_key: format!("{}:{}:v{}", job_type, target_id, version),
            payload: serde_json::json!({ "protocol_run_id": protocol_run_id }),
        }
    }

    pub fn plan_protocol(run: &ProtocolRun) -> Self {
        Self::new(JobType::PlanProtocol, run.id, run.version, run.id)
    }

    pub fn execute_step(step: &StepRun) -> Self {
        Self::new(JobType::ExecuteStep, step.id, step.version, step.protocol_run_id)
    }

    pub fn run_qa(step: &StepRun) -> Self {
        Self::new(JobType::RunQa, step.id, step.version, step.protocol_run_id)
    }

    pub fn into_record(self, max_attempts: u32) -> Job {
        let now = now_ms();
        Job {
            id: generate_job_id(),
            job_type: self.job_type,
            target_id: self.target_id,
            idempotency_key: self.idempotency_key,
            attempt: 0,
            max_attempts,
            payload: self.payload,
            status: JobStatus::Queued,
            last_error: None,
            run_after: now,
            created_at: now,
            updated_at: now,
        }
    }
}
