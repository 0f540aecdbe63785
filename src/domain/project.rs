//! Project records.

use serde::{Deserialize, Serialize};

use crate::domain::step_run::QaPolicy;
use crate::id::now_ms;

/// A repository onboarded once and referenced by protocol runs.
///
/// Only the default configuration fields change after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub git_url: String,
    pub base_branch: String,
    pub default_engine_id: Option<String>,
    pub default_qa_policy: QaPolicy,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields for onboarding a project.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProject {
    pub name: String,
    pub git_url: String,
    pub base_branch: String,
    pub default_engine_id: Option<String>,
    pub default_qa_policy: QaPolicy,
}

impl NewProject {
    pub fn new(name: impl Into<String>, git_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            git_url: git_url.into(),
            base_branch: "main".to_string(),
            default_engine_id: None,
            default_qa_policy: QaPolicy::default(),
        }
    }

    pub fn with_base_branch(mut self, branch: impl Into<String>) -> Self {
        self.base_branch = branch.into();
        self
    }

    pub fn with_engine(mut self, engine_id: impl Into<String>) -> Self {
        self.default_engine_id = Some(engine_id.into());
        self
    }

    pub fn with_qa_policy(mut self, policy: QaPolicy) -> Self {
        self.default_qa_policy = policy;
        self
    }

    pub fn into_record(self, id: i64) -> Project {
        let now = now_ms();
        Project {
            id,
            name: self.name,
            git_url: self.git_url,
            base_branch: self.base_branch,
            default_engine_id: self.default_engine_id,
            default_qa_policy: self.default_qa_policy,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Mutable configuration fields of a project.
#[derive(Debug, Clone, Default)]
pub struct ProjectConfigUpdate {
    pub default_engine_id: Option<String>,
    pub default_qa_policy: Option<QaPolicy>,
}

impl ProjectConfigUpdate {
    pub fn apply(self, project: &mut Project) {
        if let Some(engine_id) = self.default_engine_id {
            project.default_engine_id = Some(engine_id);
        }
        if let Some(policy) = self.default_qa_policy {
            project.default_qa_policy = policy;
        }
        project.updated_at = now_ms();
    }
}
