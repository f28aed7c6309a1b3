//! Core data shapes shared by the engine, the store and the HTTP layer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PipelineError, Result};
use crate::runid::RunId;

// ─── Request ─────────────────────────────────────────────────────────────────

/// Where the deployable artifact comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    /// A prebuilt image reference; no build needed.
    Image { image_ref: String },
    /// Project already on local disk (uploaded and extracted).
    Directory { path: PathBuf },
    /// Repository that must be cloned before building.
    Repository { url: String },
}

/// One deploy intent. Immutable once accepted by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub project_name: String,
    pub source: Source,
    /// Container build recipe (Dockerfile text). Written into the build
    /// context when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_definition: Option<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    pub notify_url: Url,
}

impl DeploymentRequest {
    /// Reject requests the engine must never attempt.
    pub fn validate(&self) -> Result<()> {
        let name = self.project_name.trim();
        if name.is_empty() {
            return Err(PipelineError::validation("projectName is required"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(PipelineError::validation(format!(
                "projectName {name:?} may only contain letters, digits, '-', '_' and '.'"
            )));
        }
        match &self.source {
            Source::Image { image_ref } if image_ref.trim().is_empty() => {
                return Err(PipelineError::validation("imageRef must not be empty"));
            }
            Source::Repository { url } => crate::source::check_repository_url(url)?,
            _ => {}
        }
        if !matches!(self.notify_url.scheme(), "http" | "https") {
            return Err(PipelineError::validation(format!(
                "webhookUrl must be http(s), got {}",
                self.notify_url.scheme()
            )));
        }
        Ok(())
    }

    /// Local image name for builds from source.
    pub fn image_name(&self) -> String {
        format!("{}:latest", self.project_name.trim().to_lowercase())
    }
}

// ─── Run ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StepOutcome {
    Success(serde_json::Value),
    Retryable(String),
    Fatal(String),
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success(_))
    }
}

/// One recorded attempt of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub attempt: u32,
    pub outcome: StepOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// One execution of the pipeline for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub request: DeploymentRequest,
    pub steps: Vec<StepResult>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl WorkflowRun {
    /// Memoized output of a step, if any attempt of it succeeded.
    pub fn success_of(&self, step: &str) -> Option<&serde_json::Value> {
        self.steps.iter().find_map(|s| match &s.outcome {
            StepOutcome::Success(v) if s.name == step => Some(v),
            _ => None,
        })
    }

    /// Number of attempts already recorded for a step.
    pub fn attempts_of(&self, step: &str) -> u32 {
        self.steps.iter().filter(|s| s.name == step).count() as u32
    }

    /// Outcome of the latest recorded attempt of a step.
    pub fn last_outcome_of(&self, step: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.name == step)
            .map(|s| &s.outcome)
    }
}

// ─── Remote handles ──────────────────────────────────────────────────────────

/// Project created on the deployment platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteProjectHandle(pub String);

/// Service deployed on the deployment platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteServiceHandle(pub String);

impl fmt::Display for RemoteProjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RemoteServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single deployment log line from the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub timestamp: String,
}

// ─── Build progress ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A line emitted while building or pushing an image. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildProgressEvent {
    pub image: String,
    pub stream: OutputStream,
    pub line: String,
}

// ─── Notification ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyStatus {
    Success,
    Failure,
}

/// Webhook body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub status: NotifyStatus,
    pub deployment_id: Option<String>,
    pub project_id: Option<String>,
}

// ─── Project descriptor ──────────────────────────────────────────────────────

/// Static description of a project on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDescriptor {
    pub framework: String,
    pub package_manager: String,
    pub dependencies: BTreeSet<String>,
    pub scripts: BTreeMap<String, String>,
    pub port: u16,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub has_container_definition: bool,
    pub files: Vec<String>,
}

impl Default for ProjectDescriptor {
    fn default() -> Self {
        Self {
            framework: "unknown".to_string(),
            package_manager: "npm".to_string(),
            dependencies: BTreeSet::new(),
            scripts: BTreeMap::new(),
            port: 3000,
            build_command: None,
            start_command: None,
            has_container_definition: false,
            files: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, source: Source, hook: &str) -> DeploymentRequest {
        DeploymentRequest {
            project_name: name.to_string(),
            source,
            container_definition: None,
            env_vars: BTreeMap::new(),
            notify_url: Url::parse(hook).unwrap(),
        }
    }

    #[test]
    fn validate_accepts_image_request() {
        let req = request(
            "demo",
            Source::Image {
                image_ref: "demo:latest".into(),
            },
            "http://x/hook",
        );
        req.validate().unwrap();
        assert_eq!(req.image_name(), "demo:latest");
    }

    #[test]
    fn validate_rejects_bad_fields() {
        let img = Source::Image {
            image_ref: "demo:latest".into(),
        };
        assert!(matches!(
            request("", img.clone(), "http://x/hook").validate(),
            Err(PipelineError::Validation(_))
        ));
        assert!(matches!(
            request("my app", img.clone(), "http://x/hook").validate(),
            Err(PipelineError::Validation(_))
        ));
        assert!(matches!(
            request("demo", img, "ftp://x/hook").validate(),
            Err(PipelineError::Validation(_))
        ));
        assert!(matches!(
            request("demo", Source::Image { image_ref: " ".into() }, "http://x/hook").validate(),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn notification_uses_camel_case() {
        let n = Notification {
            status: NotifyStatus::Success,
            deployment_id: Some("svc".into()),
            project_id: Some("prj".into()),
        };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["status"], "success");
        assert_eq!(v["deploymentId"], "svc");
        assert_eq!(v["projectId"], "prj");
    }

    #[test]
    fn run_helpers_find_memoized_outputs() {
        let now = Utc::now();
        let run = WorkflowRun {
            run_id: RunId::from("deploy-x"),
            request: request(
                "demo",
                Source::Image {
                    image_ref: "demo:latest".into(),
                },
                "http://x/hook",
            ),
            steps: vec![
                StepResult {
                    name: "create-project".into(),
                    attempt: 1,
                    outcome: StepOutcome::Retryable("boom".into()),
                    started_at: now,
                    ended_at: now,
                },
                StepResult {
                    name: "create-project".into(),
                    attempt: 2,
                    outcome: StepOutcome::Success(serde_json::json!("prj-1")),
                    started_at: now,
                    ended_at: now,
                },
            ],
            status: RunStatus::Running,
            failure: None,
        };
        assert_eq!(run.attempts_of("create-project"), 2);
        assert_eq!(run.success_of("create-project"), Some(&serde_json::json!("prj-1")));
        assert!(run.success_of("deploy-service").is_none());
    }
}
