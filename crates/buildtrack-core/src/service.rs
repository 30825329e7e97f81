//! Remote collaborators: build tracking and analysis import.

use crate::error::Result;
use crate::output::LogSink;
use crate::types::{Build, BuildSpec, Repo, Task, TaskDraft, TaskRef, TaskUpdate};
use std::sync::Arc;

/// The service that owns builds and mirrors task state.
#[async_trait::async_trait]
pub trait TrackingService: Send + Sync {
    /// Look up a build and its repository.
    async fn resolve_build(&self, repo: &str, id: u64) -> Result<(Build, Repo)>;

    /// Create all tasks for a build in one call. Tasks come back in draft order.
    async fn create_tasks(&self, build: &BuildSpec, drafts: &[TaskDraft]) -> Result<Vec<Task>>;

    /// Apply a partial update to one task.
    async fn update_task(&self, task: &TaskRef, update: &TaskUpdate) -> Result<()>;
}

/// Read-only view of the analysis data a build produced.
#[async_trait::async_trait]
pub trait BuildDataFs: Send + Sync {
    /// Human-readable location (path or URI).
    fn location(&self) -> String;

    /// Relative paths of every data file, sorted.
    async fn list(&self) -> Result<Vec<String>>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;
}

/// Build data, keyed by commit.
#[async_trait::async_trait]
pub trait BuildDataSource: Send + Sync {
    async fn open(&self, commit_id: &str) -> Result<Arc<dyn BuildDataFs>>;
}

/// An open connection to the analysis store.
#[async_trait::async_trait]
pub trait StoreClient: Send + Sync {
    async fn put(&self, repo: &str, commit_id: &str, path: &str, data: &[u8]) -> Result<()>;

    /// Seal the imported version so readers can see it.
    async fn finish(&self, repo: &str, commit_id: &str) -> Result<()>;
}

#[async_trait::async_trait]
pub trait AnalysisStore: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn StoreClient>>;
}

#[derive(Clone, Debug)]
pub struct ImportOptions {
    pub repo: String,
    pub commit_id: String,
    pub verbose: bool,
}

/// Publishes build data into the analysis store.
#[async_trait::async_trait]
pub trait Importer: Send + Sync {
    async fn import(
        &self,
        data: &dyn BuildDataFs,
        store: &dyn StoreClient,
        options: &ImportOptions,
        log: &LogSink,
    ) -> Result<()>;
}
