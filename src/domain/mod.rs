//! Domain types for protoflow
//!
//! This module contains all core domain types:
//! - Project: onboarded repository with default execution/QA configuration
//! - ProtocolRun: one execution of a declared protocol
//! - StepRun: one ordered unit of work inside a protocol run
//! - Event: append-only audit records
//! - Job: queue submissions and their visible states
//! - ProtocolStatus / StepStatus: the two state machines

pub mod event;
pub mod job;
pub mod project;
pub mod protocol_run;
pub mod status;
pub mod step_run;

pub use event::{EventRecord, NewEvent, event_types};
pub use job::{Job, JobStatus, JobType, NewJob};
pub use project::{NewProject, Project, ProjectConfigUpdate};
pub use protocol_run::{NewProtocolRun, ProtocolRun, ProtocolUpdate};
pub use status::{ProtocolStatus, StepStatus};
pub use step_run::{Artifact, NewStepRun, QaPolicy, RuntimeState, StepRun, StepType, StepUpdate, infer_step_type};
