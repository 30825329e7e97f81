//! Error types for buildtrack

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("resolve failed: {0}")]
    Resolve(String),

    #[error("configure failed: {0}")]
    Configure(String),

    #[error("tracking error: {op} - {message}")]
    Tracking { op: String, message: String },

    #[error("tracking service returned {received} tasks for {sent} drafts")]
    TaskCountMismatch { sent: usize, received: usize },

    /// The graph listed a target its own rule index does not know.
    #[error("no rule for target: {0}")]
    MissingRule(String),

    #[error(
        "no tasks created for {build}: probably because the required language toolchain isn't installed correctly"
    )]
    NoTasks { build: String },

    #[error("task {task} not synchronized after {attempts} attempts: {message}")]
    SyncFailed {
        task: String,
        attempts: u32,
        message: String,
    },

    #[error("event channel closed")]
    EventChannelClosed,

    #[error("graph execution failed: {0}")]
    Graph(String),

    #[error("getting build data for {repo}@{commit}: {message}")]
    BuildData {
        repo: String,
        commit: String,
        message: String,
    },

    #[error("import failed: {0}")]
    Import(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn tracking(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tracking {
            op: op.into(),
            message: message.into(),
        }
    }

    pub fn build_data(
        repo: impl Into<String>,
        commit: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::BuildData {
            repo: repo.into(),
            commit: commit.into(),
            message: message.to_string(),
        }
    }

    /// Fatal errors mean the worker must stop loudly instead of reporting a result:
    /// the graph disagrees with itself, the build has nothing to do, or remote task
    /// state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingRule(_) | Self::NoTasks { .. } | Self::SyncFailed { .. }
        )
    }
}
