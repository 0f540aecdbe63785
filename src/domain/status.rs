//! Status state machines for protocol runs and step runs.
//!
//! Statuses are the wire-visible contract; they serialize as snake_case strings
//! and every change goes through `can_transition_to`.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// ProtocolRun status state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolStatus {
    /// Created, not yet started
    Pending,
    /// Spec is being validated and steps materialized
    Planning,
    /// Steps exist, nothing executed yet
    Planned,
    /// At least one step has been scheduled
    Running,
    /// User paused; workers discard work
    Paused,
    /// Needs user action (retry, amend spec)
    Blocked,
    Failed,
    Cancelled,
    Completed,
}

impl ProtocolStatus {
    pub const ALL: [ProtocolStatus; 9] = [
        Self::Pending,
        Self::Planning,
        Self::Planned,
        Self::Running,
        Self::Paused,
        Self::Blocked,
        Self::Failed,
        Self::Cancelled,
        Self::Completed,
    ];

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Completed)
    }

    /// Active runs are candidates for branch-based signal resolution.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Planning | Self::Planned | Self::Running | Self::Paused | Self::Blocked)
    }

    /// Check whether the state machine permits `self -> next`.
    pub fn can_transition_to(&self, next: ProtocolStatus) -> bool {
        use ProtocolStatus::*;
        match self {
            Pending => matches!(next, Planning | Cancelled),
            Planning => matches!(next, Planned | Blocked | Failed | Cancelled),
            Planned => matches!(next, Running | Planning | Paused | Cancelled),
            Running => matches!(next, Paused | Blocked | Failed | Cancelled | Completed),
            Paused => matches!(next, Running | Cancelled),
            Blocked => matches!(next, Running | Planning | Failed | Cancelled),
            Failed | Cancelled | Completed => false,
        }
    }
}

impl std::fmt::Display for ProtocolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProtocolStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown protocol status '{}'", s))
    }
}

/// StepRun status state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting to be scheduled
    Pending,
    /// Holds the active-executor role
    Running,
    /// Executed, awaiting a verdict
    NeedsQa,
    Completed,
    /// Recoverable via retry
    Failed,
    Cancelled,
    /// Loop bound hit; recoverable only via manual retry
    Blocked,
}

impl StepStatus {
    pub const ALL: [StepStatus; 7] = [
        Self::Pending,
        Self::Running,
        Self::NeedsQa,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Blocked,
    ];

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::NeedsQa => "needs_qa",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Blocked => "blocked",
        }
    }

    /// Finished steps. Only a loop stepping back moves a completed step again;
    /// cancelled steps never move.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// A step that currently has work in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::NeedsQa)
    }

    /// Steps a user action may (re-)schedule.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed | Self::Blocked)
    }

    /// Check whether the state machine permits `self -> next`.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        match self {
            Pending => matches!(next, Running | Cancelled),
            Running => matches!(next, NeedsQa | Failed | Blocked | Cancelled | Pending),
            NeedsQa => matches!(next, Completed | Failed | Blocked | Cancelled | Pending),
            // NeedsQa here is a manual re-evaluation of the last execution
            Failed | Blocked => matches!(next, Running | Pending | NeedsQa | Cancelled),
            // Reset by a loop that steps back over it
            Completed => next == Pending,
            Cancelled => false,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown step status '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_status_round_trips_through_str() {
        for status in ProtocolStatus::ALL {
            assert_eq!(status.as_str().parse::<ProtocolStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ProtocolStatus>().is_err());
    }

    #[test]
    fn test_protocol_terminal_states_are_final() {
        for terminal in [ProtocolStatus::Failed, ProtocolStatus::Cancelled, ProtocolStatus::Completed] {
            assert!(terminal.is_terminal());
            for next in ProtocolStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_protocol_happy_path() {
        assert!(ProtocolStatus::Pending.can_transition_to(ProtocolStatus::Planning));
        assert!(ProtocolStatus::Planning.can_transition_to(ProtocolStatus::Planned));
        assert!(ProtocolStatus::Planned.can_transition_to(ProtocolStatus::Running));
        assert!(ProtocolStatus::Running.can_transition_to(ProtocolStatus::Completed));
        assert!(!ProtocolStatus::Pending.can_transition_to(ProtocolStatus::Running));
        assert!(!ProtocolStatus::Planning.can_transition_to(ProtocolStatus::Completed));
    }

    #[test]
    fn test_protocol_recoverable_states() {
        assert!(ProtocolStatus::Paused.can_transition_to(ProtocolStatus::Running));
        assert!(ProtocolStatus::Blocked.can_transition_to(ProtocolStatus::Running));
        assert!(!ProtocolStatus::Paused.can_transition_to(ProtocolStatus::Completed));
    }

    #[test]
    fn test_step_status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&StepStatus::NeedsQa).unwrap(), "\"needs_qa\"");
        assert_eq!("needs_qa".parse::<StepStatus>().unwrap(), StepStatus::NeedsQa);
    }

    #[test]
    fn test_step_transitions() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Running.can_transition_to(StepStatus::NeedsQa));
        assert!(StepStatus::NeedsQa.can_transition_to(StepStatus::Completed));
        assert!(StepStatus::NeedsQa.can_transition_to(StepStatus::Pending));
        assert!(StepStatus::Blocked.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Failed.can_transition_to(StepStatus::NeedsQa));
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Completed));
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::NeedsQa));
        assert!(StepStatus::Completed.can_transition_to(StepStatus::Pending));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Failed));
        assert!(!StepStatus::Cancelled.can_transition_to(StepStatus::Running));
    }

    #[test]
    fn test_step_status_predicates() {
        assert!(StepStatus::Running.is_active());
        assert!(StepStatus::NeedsQa.is_active());
        assert!(!StepStatus::Pending.is_active());
        assert!(StepStatus::Failed.is_runnable());
        assert!(StepStatus::Blocked.is_runnable());
        assert!(!StepStatus::Completed.is_runnable());
    }
}
