//! State store
//!
//! This module provides:
//! - `StateStore`: durable records for projects, protocol runs, step runs,
//!   events and jobs, with expected-status guarded updates
//! - `SqliteStore`: the rusqlite-backed implementation
//!
//! Every status change goes through `update_protocol` / `update_step`, which
//! fail with `StateConflict` when the stored status differs from the caller's
//! expectation. That guard is what keeps two workers from double-advancing
//! the same entity.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::domain::{
    EventRecord, Job, JobStatus, NewEvent, NewJob, NewProject, NewProtocolRun, NewStepRun, Project,
    ProjectConfigUpdate, ProtocolRun, ProtocolStatus, ProtocolUpdate, StepRun, StepStatus, StepUpdate,
};
use crate::error::{ProtoflowError, Result};

/// Durable record storage shared by every component.
pub trait StateStore: Send + Sync {
    fn create_project(&self, new: NewProject) -> Result<Project>;
    fn get_project(&self, id: i64) -> Result<Option<Project>>;
    fn list_projects(&self) -> Result<Vec<Project>>;
    /// Only configuration fields are mutable
    fn update_project_config(&self, id: i64, update: ProjectConfigUpdate) -> Result<Project>;

    fn create_protocol_run(&self, new: NewProtocolRun) -> Result<ProtocolRun>;
    fn get_protocol_run(&self, id: i64) -> Result<Option<ProtocolRun>>;
    fn list_protocol_runs(&self, project_id: Option<i64>) -> Result<Vec<ProtocolRun>>;
    /// Conditional update; `StateConflict` if the stored status is not `expected`
    fn update_protocol(&self, id: i64, expected: ProtocolStatus, update: ProtocolUpdate) -> Result<ProtocolRun>;

    /// Fails if the (protocol, index) or (protocol, name) pair already exists
    fn create_step_run(&self, new: NewStepRun) -> Result<StepRun>;
    fn get_step_run(&self, id: i64) -> Result<Option<StepRun>>;
    /// Ordered by step_index
    fn list_step_runs(&self, protocol_run_id: i64) -> Result<Vec<StepRun>>;
    /// Conditional update; `StateConflict` if the stored status is not `expected`.
    /// Tokens carried by the update are added to the protocol's usage in the same transaction.
    fn update_step(&self, id: i64, expected: StepStatus, update: StepUpdate) -> Result<StepRun>;
    /// Tokens recorded against a protocol run so far
    fn protocol_token_usage(&self, protocol_run_id: i64) -> Result<u64>;

    fn append_event(&self, event: NewEvent) -> Result<EventRecord>;
    /// Oldest first; `None` lists every event
    fn list_events(&self, protocol_run_id: Option<i64>) -> Result<Vec<EventRecord>>;

    /// Insert unless the idempotency key exists; returns the stored job and whether it was new
    fn insert_job(&self, new: NewJob, max_attempts: u32) -> Result<(Job, bool)>;
    fn get_job(&self, id: &str) -> Result<Option<Job>>;
    /// Atomically start the oldest due job, leasing it for `lease_ms`.
    /// A started job whose lease ran out counts as due.
    fn claim_next_job(&self, now: i64, lease_ms: i64) -> Result<Option<Job>>;
    /// Put every started job back in the queue; returns how many moved
    fn requeue_started_jobs(&self, reason: &str) -> Result<usize>;
    fn save_job(&self, job: &Job) -> Result<()>;
    fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>>;
    fn count_jobs(&self, status: JobStatus) -> Result<usize>;

    /// Fetch a project or fail with `NotFound`
    fn project(&self, id: i64) -> Result<Project> {
        self.get_project(id)?.ok_or_else(|| ProtoflowError::not_found("project", id))
    }

    /// Fetch a protocol run or fail with `NotFound`
    fn protocol_run(&self, id: i64) -> Result<ProtocolRun> {
        self.get_protocol_run(id)?
            .ok_or_else(|| ProtoflowError::not_found("protocol_run", id))
    }

    /// Fetch a step run or fail with `NotFound`
    fn step_run(&self, id: i64) -> Result<StepRun> {
        self.get_step_run(id)?.ok_or_else(|| ProtoflowError::not_found("step_run", id))
    }

    /// Protocol runs that can still receive signals
    fn list_active_protocol_runs(&self) -> Result<Vec<ProtocolRun>> {
        Ok(self
            .list_protocol_runs(None)?
            .into_iter()
            .filter(|run| run.status.is_active())
            .collect())
    }

    /// Resolve a CI branch or ref to an active protocol run.
    ///
    /// `refs/heads/` and `refs/tags/` prefixes are stripped and the full ref is
    /// matched first. The last path segment is a fallback only when it names
    /// exactly one active run and no other active run ends in that segment,
    /// so `team-a/feature` never resolves to `team-b/feature`.
    fn find_protocol_run_by_branch(&self, branch: &str) -> Result<Option<ProtocolRun>> {
        let trimmed = branch
            .strip_prefix("refs/heads/")
            .or_else(|| branch.strip_prefix("refs/tags/"))
            .unwrap_or(branch);

        let active = self.list_active_protocol_runs()?;
        // Newest run wins when names repeat
        if let Some(run) = active.iter().rev().find(|run| run.matches_branch(trimmed)) {
            return Ok(Some(run.clone()));
        }

        let Some((_, last)) = trimmed.rsplit_once('/') else {
            return Ok(None);
        };
        let suffix = format!("/{}", last);
        let candidates: Vec<&ProtocolRun> = active
            .iter()
            .filter(|run| run.matches_branch(last) || run.protocol_name.ends_with(&suffix))
            .collect();
        match candidates.as_slice() {
            [run] if run.matches_branch(last) => Ok(Some((*run).clone())),
            [] => Ok(None),
            _ => {
                log::warn!("Branch {} does not identify a single active run", branch);
                Ok(None)
            }
        }
    }

    /// The step a signal most plausibly refers to: the active one, else the most recently updated
    fn latest_step_run(&self, protocol_run_id: i64) -> Result<Option<StepRun>> {
        let steps = self.list_step_runs(protocol_run_id)?;
        if let Some(active) = steps.iter().find(|s| s.status.is_active()) {
            return Ok(Some(active.clone()));
        }
        Ok(steps.into_iter().max_by_key(|s| (s.updated_at, s.id)))
    }
}
