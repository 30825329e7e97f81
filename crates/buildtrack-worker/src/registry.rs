//! Task registry: batch task creation and serialized status transitions.

use buildtrack_core::{
    BuildSpec, Error, Result, Task, TaskDraft, TaskRef, TaskUpdate, TrackingService,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded exponential backoff for task updates.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// One attempt, no retries.
    pub fn fail_fast() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt number `attempt + 1` (1-based `attempt`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

pub struct TaskRegistry {
    tracker: Arc<dyn TrackingService>,
    build: BuildSpec,
    retry: RetryPolicy,
}

impl TaskRegistry {
    pub fn new(tracker: Arc<dyn TrackingService>, build: BuildSpec, retry: RetryPolicy) -> Self {
        Self {
            tracker,
            build,
            retry,
        }
    }

    /// Create every task in one call. The result is positionally aligned with `drafts`.
    pub async fn register(&self, drafts: &[TaskDraft]) -> Result<Vec<Task>> {
        let tasks = self.tracker.create_tasks(&self.build, drafts).await?;
        if tasks.len() != drafts.len() {
            return Err(Error::TaskCountMismatch {
                sent: drafts.len(),
                received: tasks.len(),
            });
        }
        debug!(build = %self.build, count = tasks.len(), "registered tasks");
        Ok(tasks)
    }

    pub async fn mark_started(&self, task: &TaskRef) -> Result<()> {
        self.update(task, TaskUpdate::started(Utc::now())).await
    }

    pub async fn mark_ended(&self, task: &TaskRef) -> Result<()> {
        self.update(task, TaskUpdate::ended(Utc::now())).await
    }

    pub async fn mark_succeeded(&self, task: &TaskRef) -> Result<()> {
        self.update(task, TaskUpdate::succeeded()).await
    }

    pub async fn mark_failed(&self, task: &TaskRef) -> Result<()> {
        self.update(task, TaskUpdate::failed()).await
    }

    async fn update(&self, task: &TaskRef, update: TaskUpdate) -> Result<()> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.tracker.update_task(task, &update).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        task = %task,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "task update failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::SyncFailed {
                        task: task.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}
