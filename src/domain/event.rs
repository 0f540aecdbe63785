//! Append-only audit events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::now_ms;

/// Event type constants
pub mod event_types {
    pub const PROTOCOL_CREATED: &str = "protocol_created";
    pub const PLANNING_ENQUEUED: &str = "planning_enqueued";
    pub const PLANNED: &str = "planned";
    pub const SPEC_VALIDATION_ERROR: &str = "spec_validation_error";
    pub const PROTOCOL_PAUSED: &str = "protocol_paused";
    pub const PROTOCOL_RESUMED: &str = "protocol_resumed";
    pub const PROTOCOL_CANCELLED: &str = "protocol_cancelled";
    pub const PROTOCOL_BLOCKED: &str = "protocol_blocked";
    pub const PROTOCOL_COMPLETED: &str = "protocol_completed";
    pub const STEP_ENQUEUED: &str = "step_enqueued";
    pub const STEP_STARTED: &str = "step_started";
    pub const STEP_EXECUTED: &str = "step_executed";
    pub const STEP_DEGRADED: &str = "step_degraded";
    pub const STEP_FAILED: &str = "step_failed";
    pub const STEP_COMPLETED: &str = "step_completed";
    pub const STEP_RETRY: &str = "step_retry";
    pub const RESULT_DISCARDED: &str = "result_discarded";
    pub const QA_ENQUEUED: &str = "qa_enqueued";
    pub const QA_SKIPPED: &str = "qa_skipped";
    pub const QA_UNAVAILABLE: &str = "qa_unavailable";
    pub const QA_PASSED: &str = "qa_passed";
    pub const QA_FAILED: &str = "qa_failed";
    pub const MANUAL_APPROVAL: &str = "manual_approval";
    pub const LOOP_DECISION: &str = "loop_decision";
    pub const LOOP_LIMIT_REACHED: &str = "loop_limit_reached";
    pub const LOOP_CONDITION_SKIPPED: &str = "loop_condition_skipped";
    pub const TRIGGER_DECISION: &str = "trigger_decision";
    pub const TRIGGER_ENQUEUED: &str = "trigger_enqueued";
    pub const TRIGGER_EXECUTED_INLINE: &str = "trigger_executed_inline";
    pub const TRIGGER_INLINE_DEPTH_EXCEEDED: &str = "trigger_inline_depth_exceeded";
    pub const TRIGGER_SKIPPED: &str = "trigger_skipped";
    pub const TRIGGER_CONDITION_SKIPPED: &str = "trigger_condition_skipped";
    pub const TRIGGER_MISSING_TARGET: &str = "trigger_missing_target";
    pub const BUDGET_WARNING: &str = "budget_warning";
    pub const TRANSITION_REJECTED: &str = "transition_rejected";
    pub const JOB_FAILED: &str = "job_failed";
    pub const CI_RUNNING: &str = "ci_running";
    pub const CI_PASSED: &str = "ci_passed";
    pub const CI_FAILED: &str = "ci_failed";
    pub const CI_IGNORED: &str = "ci_ignored";
    pub const RECONCILIATION_MISMATCH: &str = "reconciliation_mismatch";
}

/// A persisted, write-once event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub id: i64,
    /// None only for signals that matched no protocol run
    pub protocol_run_id: Option<i64>,
    pub step_run_id: Option<i64>,
    pub event_type: String,
    /// Human-readable; a blocked entity's reason lives here
    pub message: String,
    pub metadata: Value,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
}

/// Builder for an event to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub protocol_run_id: Option<i64>,
    pub step_run_id: Option<i64>,
    pub event_type: String,
    pub message: String,
    pub metadata: Value,
}

impl NewEvent {
    pub fn new(event_type: &str, message: impl Into<String>) -> Self {
        Self {
            protocol_run_id: None,
            step_run_id: None,
            event_type: event_type.to_string(),
            message: message.into(),
            metadata: Value::Null,
        }
    }

    /// Event scoped to a protocol run
    pub fn protocol(event_type: &str, protocol_run_id: i64, message: impl Into<String>) -> Self {
        let mut event = Self::new(event_type, message);
        event.protocol_run_id = Some(protocol_run_id);
        event
    }

    /// Event scoped to a step run
    pub fn step(event_type: &str, protocol_run_id: i64, step_run_id: i64, message: impl Into<String>) -> Self {
        let mut event = Self::protocol(event_type, protocol_run_id, message);
        event.step_run_id = Some(step_run_id);
        event
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn into_record(self, id: i64) -> EventRecord {
        EventRecord {
            id,
            protocol_run_id: self.protocol_run_id,
            step_run_id: self.step_run_id,
            event_type: self.event_type,
            message: self.message,
            metadata: self.metadata,
            created_at: now_ms(),
        }
    }
}
