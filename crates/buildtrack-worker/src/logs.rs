//! Log multiplexer: one isolated, retrievable sink per tracked task.
//!
//! The orchestrator asks for a sink by task; the backend decides where it lives.
//! Local filesystem and in-memory backends ship here.

use buildtrack_core::{LogSink, Repo, Result, TaskRef};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Banner written to every freshly allocated sink.
pub fn banner(target: &str) -> String {
    format!("rule for target: {target}")
}

/// Pluggable log backend.
#[async_trait::async_trait]
pub trait LogMux: Send + Sync {
    /// Allocate the sink for `task` and return it with a human-presentable
    /// destination. The target banner is already written when this returns.
    async fn open_sink(&self, task: &TaskRef, target: &str) -> Result<(LogSink, String)>;
}

/// Writes `<base>/<repo-slug>/<build-id>/<task-id>.log`.
pub struct LocalFsLogs {
    base_dir: PathBuf,
}

impl LocalFsLogs {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn log_path(&self, task: &TaskRef) -> PathBuf {
        self.base_dir
            .join(Repo::new(task.build.repo.as_str()).slug())
            .join(task.build.id.to_string())
            .join(format!("{}.log", task.id_string()))
    }
}

#[async_trait::async_trait]
impl LogMux for LocalFsLogs {
    async fn open_sink(&self, task: &TaskRef, target: &str) -> Result<(LogSink, String)> {
        let path = self.log_path(task);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let sink = LogSink::create_file(&path).await?;
        sink.line(banner(target)).await?;
        tracing::debug!(task = %task, path = %path.display(), "opened task log");
        Ok((sink, path.display().to_string()))
    }
}

/// Keeps every sink in memory, addressable by task.
#[derive(Default)]
pub struct MemoryLogs {
    sinks: Mutex<BTreeMap<TaskRef, LogSink>>,
}

impl MemoryLogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self, task: &TaskRef) -> Option<LogSink> {
        self.lock().get(task).cloned()
    }

    /// Number of sinks allocated so far.
    pub fn allocated(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<TaskRef, LogSink>> {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl LogMux for MemoryLogs {
    async fn open_sink(&self, task: &TaskRef, target: &str) -> Result<(LogSink, String)> {
        let sink = LogSink::memory();
        sink.line(banner(target)).await?;
        self.lock().insert(task.clone(), sink.clone());
        Ok((sink, format!("mem://{}", task.id_string())))
    }
}
