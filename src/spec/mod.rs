//! Spec resolver
//!
//! Parses and validates declarative protocol specs, resolves per-step policy
//! once, and materializes StepRuns from the result.

pub mod files;
pub mod model;
pub mod sync;
pub mod validate;

pub use files::build_spec_from_files;
pub use model::{ProtocolSpec, QaSpec, ResolvedSpec, ResolvedStep, SpecDefaults, StepSpec, parse_spec};
pub use sync::sync_step_runs;
pub use validate::{spec_hash, validate_spec};
