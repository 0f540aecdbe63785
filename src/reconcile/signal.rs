//! Normalized CI callbacks.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ProtoflowError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CiProvider {
    Github,
    Gitlab,
    #[default]
    Generic,
}

impl CiProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Generic => "generic",
        }
    }
}

impl std::fmt::Display for CiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CiProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(Self::Github),
            "gitlab" => Ok(Self::Gitlab),
            "generic" => Ok(Self::Generic),
            other => Err(format!("unknown CI provider '{}'", other)),
        }
    }
}

/// How a signal names its protocol run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiTarget {
    RunId(i64),
    /// Branch or full ref; resolved against active runs
    Branch(String),
}

impl std::fmt::Display for CiTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RunId(id) => write!(f, "run {}", id),
            Self::Branch(branch) => write!(f, "branch {}", branch),
        }
    }
}

/// Provider status reduced to what the reconciler acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiStatus {
    Running,
    Success,
    Failure,
    Unrecognized,
}

impl CiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// Map a raw provider status onto `CiStatus`, ignoring case.
pub fn normalize_status(raw: &str) -> CiStatus {
    match raw.trim().to_lowercase().as_str() {
        "in_progress" | "queued" | "requested" | "pending" | "running" => CiStatus::Running,
        "success" | "passed" | "neutral" | "ok" | "merged" | "merge" => CiStatus::Success,
        "failure" | "failed" | "error" | "timed_out" | "cancelled" | "canceled" | "action_required" => {
            CiStatus::Failure
        }
        _ => CiStatus::Unrecognized,
    }
}

/// A CI callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiSignal {
    pub provider: CiProvider,
    pub target: CiTarget,
    /// Raw provider status; see `normalize_status`
    pub status: String,
    /// Step the callback is about, when the caller knows it
    #[serde(default)]
    pub step_run_id: Option<i64>,
    #[serde(default)]
    pub metadata: Value,
}

impl CiSignal {
    pub fn new(provider: CiProvider, target: CiTarget, status: impl Into<String>) -> Self {
        Self {
            provider,
            target,
            status: status.into(),
            step_run_id: None,
            metadata: Value::Null,
        }
    }

    pub fn for_step(mut self, step_run_id: i64) -> Self {
        self.step_run_id = Some(step_run_id);
        self
    }

    pub fn normalized(&self) -> CiStatus {
        normalize_status(&self.status)
    }

    /// Parse a GitHub webhook body for the given `X-GitHub-Event`.
    ///
    /// The conclusion wins over the status when both are present, so a
    /// completed run reports how it ended.
    pub fn from_github(event: &str, payload: &Value) -> Result<Self> {
        let mut branch = str_at(payload, &["ref"]).or_else(|| str_at(payload, &["branch"]));
        let mut status = None;
        let mut conclusion = None;
        let mut pr_number = None;

        match event {
            "workflow_run" => {
                let run = &payload["workflow_run"];
                status = str_at(run, &["status"]);
                conclusion = str_at(run, &["conclusion"]);
                branch = str_at(run, &["head_branch"]).or(branch);
                pr_number = run["pull_requests"][0]["number"].as_i64();
            }
            "check_suite" | "check_run" => {
                let check = if payload["check_suite"].is_object() {
                    &payload["check_suite"]
                } else {
                    &payload["check_run"]
                };
                status = str_at(check, &["status"]);
                conclusion = str_at(check, &["conclusion"]);
                branch = str_at(check, &["head_branch"])
                    .or_else(|| str_at(check, &["check_suite", "head_branch"]))
                    .or(branch);
                pr_number = check["pull_requests"][0]["number"].as_i64();
            }
            "pull_request" => {
                let pr = &payload["pull_request"];
                branch = str_at(pr, &["head", "ref"]).or(branch);
                pr_number = pr["number"].as_i64();
                status = str_at(pr, &["state"]);
                conclusion = if pr["merged"].as_bool() == Some(true) {
                    Some("merged".to_string())
                } else {
                    None
                };
            }
            "status" => {
                branch = str_at(&payload["branches"][0], &["name"]).or(branch);
                status = str_at(payload, &["state"]);
            }
            _ => {}
        }

        let branch = branch.ok_or_else(|| {
            ProtoflowError::Validation(vec![format!("github {} payload names no branch", event)])
        })?;
        let raw = conclusion.clone().or(status.clone()).unwrap_or_default();
        let mut signal = Self::new(CiProvider::Github, CiTarget::Branch(branch), raw);
        signal.metadata = json!({
            "event": event,
            "action": payload["action"],
            "status": status,
            "conclusion": conclusion,
            "pr_number": pr_number,
            "sha": payload["after"],
        });
        Ok(signal)
    }

    /// Parse a GitLab webhook body (pipeline, merge_request, job hooks).
    pub fn from_gitlab(payload: &Value) -> Result<Self> {
        let attrs = &payload["object_attributes"];
        let kind = str_at(payload, &["object_kind"]).unwrap_or_else(|| "unknown".to_string());
        let branch = str_at(attrs, &["source_branch"])
            .or_else(|| str_at(attrs, &["ref"]))
            .or_else(|| str_at(payload, &["ref"]))
            .ok_or_else(|| ProtoflowError::Validation(vec![format!("gitlab {} payload names no branch", kind)]))?;

        let state = str_at(attrs, &["state"]);
        let raw = if kind == "merge_request" && state.as_deref() == Some("merged") {
            "merged".to_string()
        } else {
            str_at(attrs, &["status"]).or(state).unwrap_or_default()
        };

        let mut signal = Self::new(CiProvider::Gitlab, CiTarget::Branch(branch), raw);
        signal.metadata = json!({
            "event": kind,
            "pr_number": attrs["iid"],
        });
        Ok(signal)
    }
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}
