//! Core types for buildtrack

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label reserved for the synthetic task that publishes analysis data.
pub const IMPORT_TASK_LABEL: &str = "import";

fn slugify(s: &str) -> String {
    s.replace(['/', ':'], "-")
}

/// A repository as resolved by the tracking service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repo {
    pub uri: String,
}

impl Repo {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    /// `github.com/acme/widgets` -> `github.com-acme-widgets`
    pub fn slug(&self) -> String {
        slugify(&self.uri)
    }
}

/// Reference to a build: the repository it belongs to plus its number.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BuildSpec {
    pub repo: String,
    pub id: u64,
}

impl std::fmt::Display for BuildSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repo, self.id)
    }
}

/// A build as known to the tracking service. Immutable from the worker's side.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Build {
    pub repo: String,
    pub id: u64,
    /// Revision the build was requested for (branch, tag, ...).
    pub rev: String,
    /// Absolute commit the revision resolved to.
    pub commit_id: String,
}

impl Build {
    pub fn spec(&self) -> BuildSpec {
        BuildSpec {
            repo: self.repo.clone(),
            id: self.id,
        }
    }
}

impl std::fmt::Display for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{} ({}@{})", self.repo, self.id, self.rev, self.commit_id)
    }
}

/// Reference to a task, assigned by the tracking service at creation time.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskRef {
    pub build: BuildSpec,
    pub id: u64,
}

impl TaskRef {
    /// Filesystem-safe identifier, e.g. `github.com-acme-widgets-7-3`.
    pub fn id_string(&self) -> String {
        format!(
            "{}-{}-{}",
            slugify(&self.build.repo),
            self.build.id,
            self.id
        )
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/tasks/{}", self.build, self.id)
    }
}

/// What the worker asks the tracking service to create.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDraft {
    pub label: String,
}

impl TaskDraft {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn import() -> Self {
        Self::new(IMPORT_TASK_LABEL)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Unknown,
    Succeeded,
    Failed,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A remotely tracked unit of work.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub spec: TaskRef,
    pub label: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub failure: bool,
}

impl Task {
    pub fn new(spec: TaskRef, label: impl Into<String>) -> Self {
        Self {
            spec,
            label: label.into(),
            started_at: None,
            ended_at: None,
            success: false,
            failure: false,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match (self.success, self.failure) {
            (true, false) => Outcome::Succeeded,
            (false, true) => Outcome::Failed,
            _ => Outcome::Unknown,
        }
    }

    /// Ended with a recorded outcome. A started task without both is still in flight.
    pub fn is_terminal(&self) -> bool {
        self.ended_at.is_some() && self.outcome() != Outcome::Unknown
    }

    /// Apply a partial update: only fields present in `update` change.
    pub fn apply(&mut self, update: &TaskUpdate) {
        if let Some(at) = update.started_at {
            self.started_at = Some(at);
        }
        if let Some(at) = update.ended_at {
            self.ended_at = Some(at);
        }
        if let Some(success) = update.success {
            self.success = success;
        }
        if let Some(failure) = update.failure {
            self.failure = failure;
        }
    }
}

/// Partial task update. Absent fields are left unchanged by the tracking service.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<bool>,
}

impl TaskUpdate {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn ended(at: DateTime<Utc>) -> Self {
        Self {
            ended_at: Some(at),
            ..Default::default()
        }
    }

    pub fn succeeded() -> Self {
        Self {
            success: Some(true),
            failure: Some(false),
            ..Default::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            success: Some(false),
            failure: Some(true),
            ..Default::default()
        }
    }
}
