//! ProtocolRun records: one execution of a declared protocol against a project.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::status::ProtocolStatus;
use crate::id::now_ms;
use crate::spec::ProtocolSpec;

/// A persisted protocol run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolRun {
    pub id: i64,
    pub project_id: i64,
    /// Also the branch name CI signals are matched against
    pub protocol_name: String,
    pub status: ProtocolStatus,
    pub base_branch: String,
    pub worktree_path: Option<PathBuf>,
    /// Directory holding `NN-*.md` step files, used when no spec is embedded
    pub protocol_root: Option<PathBuf>,
    pub description: Option<String>,
    pub spec: Option<ProtocolSpec>,
    pub spec_hash: Option<String>,
    /// Bumped on every persisted change
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProtocolRun {
    /// Whether a CI branch name refers to this run.
    pub fn matches_branch(&self, branch: &str) -> bool {
        self.protocol_name == branch
    }
}

/// Fields for opening a protocol run.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProtocolRun {
    pub project_id: i64,
    pub protocol_name: String,
    pub base_branch: String,
    pub worktree_path: Option<PathBuf>,
    pub protocol_root: Option<PathBuf>,
    pub description: Option<String>,
    pub spec: Option<ProtocolSpec>,
}

impl NewProtocolRun {
    pub fn new(project_id: i64, protocol_name: impl Into<String>, base_branch: impl Into<String>) -> Self {
        Self {
            project_id,
            protocol_name: protocol_name.into(),
            base_branch: base_branch.into(),
            worktree_path: None,
            protocol_root: None,
            description: None,
            spec: None,
        }
    }

    pub fn with_spec(mut self, spec: ProtocolSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn with_protocol_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.protocol_root = Some(root.into());
        self
    }

    pub fn with_worktree(mut self, path: impl Into<PathBuf>) -> Self {
        self.worktree_path = Some(path.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn into_record(self, id: i64) -> ProtocolRun {
        let now = now_ms();
        ProtocolRun {
            id,
            project_id: self.project_id,
            protocol_name: self.protocol_name,
            status: ProtocolStatus::Pending,
            base_branch: self.base_branch,
            worktree_path: self.worktree_path,
            protocol_root: self.protocol_root,
            description: self.description,
            spec: self.spec,
            spec_hash: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied under an expected-status guard.
#[derive(Debug, Clone, Default)]
pub struct ProtocolUpdate {
    pub status: Option<ProtocolStatus>,
    pub spec: Option<ProtocolSpec>,
    pub spec_hash: Option<String>,
    pub worktree_path: Option<PathBuf>,
}

impl ProtocolUpdate {
    /// Start an update that moves the protocol to `status`
    pub fn to(status: ProtocolStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn spec(mut self, spec: ProtocolSpec, hash: impl Into<String>) -> Self {
        self.spec = Some(spec);
        self.spec_hash = Some(hash.into());
        self
    }

    pub fn apply(self, run: &mut ProtocolRun) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(spec) = self.spec {
            run.spec = Some(spec);
        }
        if let Some(hash) = self.spec_hash {
            run.spec_hash = Some(hash);
        }
        if let Some(path) = self.worktree_path {
            run.worktree_path = Some(path);
        }
        run.version += 1;
        run.updated_at = now_ms();
    }
}
