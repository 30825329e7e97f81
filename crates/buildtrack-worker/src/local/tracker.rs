//! In-process tracking service with optional on-disk persistence.
//!
//! Persistent trackers keep, per build:
//! - `tasks.yaml`: the current state of every task, rewritten on each change
//! - `updates.jsonl`: one line per update as it was received

use async_trait::async_trait;
use buildtrack_core::{
    Build, BuildSpec, Error, Repo, Result, Task, TaskDraft, TaskRef, TaskUpdate, TrackingService,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Persisted state of one build.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build: Build,
    pub repo: Repo,
    pub tasks: Vec<Task>,
}

/// One journal line.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateEntry {
    pub ts: DateTime<Utc>,
    pub task: TaskRef,
    pub update: TaskUpdate,
}

#[derive(Default)]
pub struct LocalTracker {
    builds: Mutex<BTreeMap<BuildSpec, BuildRecord>>,
    runs_dir: Option<PathBuf>,
}

impl LocalTracker {
    /// Memory-only tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that mirrors every change under `<runs_dir>/<repo-slug>/<build-id>/`.
    pub fn persistent(runs_dir: impl AsRef<Path>) -> Self {
        Self {
            builds: Mutex::new(BTreeMap::new()),
            runs_dir: Some(runs_dir.as_ref().to_path_buf()),
        }
    }

    /// Make `build` resolvable.
    pub fn with_build(mut self, build: Build, repo: Repo) -> Self {
        self.builds.get_mut().insert(
            build.spec(),
            BuildRecord {
                build,
                repo,
                tasks: Vec::new(),
            },
        );
        self
    }

    /// Snapshot of a build's tasks in creation order.
    pub async fn tasks(&self, build: &BuildSpec) -> Vec<Task> {
        self.builds
            .lock()
            .await
            .get(build)
            .map(|r| r.tasks.clone())
            .unwrap_or_default()
    }

    pub fn run_dir(&self, build: &BuildSpec) -> Option<PathBuf> {
        self.runs_dir.as_ref().map(|dir| {
            dir.join(Repo::new(build.repo.as_str()).slug())
                .join(build.id.to_string())
        })
    }

    async fn write_manifest(&self, record: &BuildRecord) -> Result<()> {
        let Some(dir) = self.run_dir(&record.build.spec()) else {
            return Ok(());
        };
        tokio::fs::create_dir_all(&dir).await?;
        let yaml = serde_yaml::to_string(record)
            .map_err(|e| Error::tracking("write manifest", e.to_string()))?;
        tokio::fs::write(dir.join("tasks.yaml"), yaml).await?;
        Ok(())
    }

    async fn append_update(&self, task: &TaskRef, update: &TaskUpdate) -> Result<()> {
        let Some(dir) = self.run_dir(&task.build) else {
            return Ok(());
        };
        tokio::fs::create_dir_all(&dir).await?;
        let entry = UpdateEntry {
            ts: Utc::now(),
            task: task.clone(),
            update: update.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("updates.jsonl"))
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl TrackingService for LocalTracker {
    async fn resolve_build(&self, repo: &str, id: u64) -> Result<(Build, Repo)> {
        let spec = BuildSpec {
            repo: repo.to_string(),
            id,
        };
        self.builds
            .lock()
            .await
            .get(&spec)
            .map(|r| (r.build.clone(), r.repo.clone()))
            .ok_or_else(|| Error::Resolve(format!("no build {spec}")))
    }

    async fn create_tasks(&self, build: &BuildSpec, drafts: &[TaskDraft]) -> Result<Vec<Task>> {
        let mut builds = self.builds.lock().await;
        let record = builds
            .get_mut(build)
            .ok_or_else(|| Error::tracking("create tasks", format!("no build {build}")))?;

        let first_id = record.tasks.len() as u64 + 1;
        let created: Vec<Task> = drafts
            .iter()
            .zip(first_id..)
            .map(|(draft, id)| {
                Task::new(
                    TaskRef {
                        build: build.clone(),
                        id,
                    },
                    draft.label.as_str(),
                )
            })
            .collect();
        record.tasks.extend(created.iter().cloned());

        let snapshot = record.clone();
        drop(builds);
        self.write_manifest(&snapshot).await?;
        tracing::debug!(build = %build, count = created.len(), "created tasks");
        Ok(created)
    }

    async fn update_task(&self, task: &TaskRef, update: &TaskUpdate) -> Result<()> {
        let mut builds = self.builds.lock().await;
        let record = builds
            .get_mut(&task.build)
            .ok_or_else(|| Error::tracking("update task", format!("no build {}", task.build)))?;
        let stored = record
            .tasks
            .iter_mut()
            .find(|t| t.spec == *task)
            .ok_or_else(|| Error::tracking("update task", format!("no task {task}")))?;
        stored.apply(update);

        let snapshot = record.clone();
        drop(builds);
        self.append_update(task, update).await?;
        self.write_manifest(&snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildtrack_core::Outcome;

    fn build() -> Build {
        Build {
            repo: "github.com/acme/widgets".into(),
            id: 7,
            rev: "main".into(),
            commit_id: "c0ffee".into(),
        }
    }

    #[tokio::test]
    async fn resolves_only_known_builds() {
        let tracker = LocalTracker::new().with_build(build(), Repo::new("github.com/acme/widgets"));
        let (b, repo) = tracker
            .resolve_build("github.com/acme/widgets", 7)
            .await
            .unwrap();
        assert_eq!(b.commit_id, "c0ffee");
        assert_eq!(repo.uri, "github.com/acme/widgets");

        let err = tracker.resolve_build("github.com/acme/widgets", 8).await;
        assert!(matches!(err, Err(Error::Resolve(_))));
    }

    #[tokio::test]
    async fn tasks_are_numbered_in_draft_order() {
        let tracker = LocalTracker::new().with_build(build(), Repo::new("github.com/acme/widgets"));
        let spec = build().spec();
        let tasks = tracker
            .create_tasks(&spec, &[TaskDraft::new("graph: a"), TaskDraft::import()])
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].spec.id, 1);
        assert_eq!(tasks[0].label, "graph: a");
        assert_eq!(tasks[1].spec.id, 2);
        assert_eq!(tasks[1].label, "import");
    }

    #[tokio::test]
    async fn updates_are_partial_and_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = LocalTracker::persistent(tmp.path())
            .with_build(build(), Repo::new("github.com/acme/widgets"));
        let spec = build().spec();
        let task = tracker
            .create_tasks(&spec, &[TaskDraft::new("graph: a")])
            .await
            .unwrap()
            .remove(0)
            .spec;

        tracker
            .update_task(&task, &TaskUpdate::started(Utc::now()))
            .await
            .unwrap();
        tracker
            .update_task(&task, &TaskUpdate::failed())
            .await
            .unwrap();
        tracker
            .update_task(&task, &TaskUpdate::ended(Utc::now()))
            .await
            .unwrap();

        let stored = &tracker.tasks(&spec).await[0];
        assert!(stored.started_at.is_some());
        assert_eq!(stored.outcome(), Outcome::Failed);
        assert!(stored.is_terminal());

        let dir = tracker.run_dir(&spec).unwrap();
        let journal = std::fs::read_to_string(dir.join("updates.jsonl")).unwrap();
        assert_eq!(journal.lines().count(), 3);
        let manifest: BuildRecord =
            serde_yaml::from_str(&std::fs::read_to_string(dir.join("tasks.yaml")).unwrap())
                .unwrap();
        assert_eq!(manifest.tasks[0].outcome(), Outcome::Failed);
    }

    #[tokio::test]
    async fn unknown_task_is_an_error() {
        let tracker = LocalTracker::new().with_build(build(), Repo::new("github.com/acme/widgets"));
        let task = TaskRef {
            build: build().spec(),
            id: 99,
        };
        let err = tracker
            .update_task(&task, &TaskUpdate::succeeded())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tracking { .. }));
    }
}
