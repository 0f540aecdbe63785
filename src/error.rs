//! Error types for protoflow
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in protoflow
#[derive(Debug, Error)]
pub enum ProtoflowError {
    /// Expected-status precondition failed; the caller must re-read and retry
    #[error("State conflict on {entity} {id}: expected {expected}, found {actual}")]
    StateConflict {
        entity: &'static str,
        id: i64,
        expected: String,
        actual: String,
    },

    /// Transition not permitted by the state machine
    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: i64,
        from: String,
        to: String,
    },

    /// Loop bound reached; terminal for the step until a manual retry
    #[error("Policy exceeded: {0}")]
    PolicyExceeded(String),

    /// External capability could not be reached
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// External capability ran and failed
    #[error("Engine failure: {message}")]
    EngineFailure { message: String, retryable: bool },

    /// Token budget exceeded in strict mode
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Malformed protocol spec, with every violation found
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// External callback references an unknown branch or run
    #[error("Reconciliation mismatch: {0}")]
    ReconciliationMismatch(String),

    /// Record not found in storage
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ProtoflowError {
    /// Shorthand for a missing record
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the queue should retry a job that failed with this error.
    ///
    /// Policy, validation and conflict errors always need an explicit user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::EngineUnavailable(_) | Self::Storage(_) | Self::Sqlite(_) | Self::Io(_) => true,
            Self::EngineFailure { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether this is an expected-status mismatch
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StateConflict { .. })
    }
}

/// Result type alias for protoflow operations
pub type Result<T> = std::result::Result<T, ProtoflowError>;
