//! Event router: the single consumer between the graph engine and the task registry.

use crate::registry::TaskRegistry;
use buildtrack_core::{EventReceiver, Result, RuleEvent, TaskRef};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Rule -> task correspondence, built once before execution and read-only after.
#[derive(Debug, Default)]
pub struct RuleTable {
    tasks: HashMap<String, TaskRef>,
    phony: HashSet<String>,
}

/// Where an event for a given target goes.
#[derive(Debug, PartialEq, Eq)]
pub enum Route<'a> {
    Phony,
    Task(&'a TaskRef),
    Unknown,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_task(&mut self, target: impl Into<String>, task: TaskRef) {
        self.tasks.insert(target.into(), task);
    }

    pub fn insert_phony(&mut self, target: impl Into<String>) {
        self.phony.insert(target.into());
    }

    pub fn route(&self, target: &str) -> Route<'_> {
        if self.phony.contains(target) {
            return Route::Phony;
        }
        match self.tasks.get(target) {
            Some(task) => Route::Task(task),
            None => Route::Unknown,
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Counters for one routing session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterReport {
    /// Events turned into registry updates.
    pub forwarded: usize,
    /// Phony or unknown-target events acknowledged without an update.
    pub dropped: usize,
}

pub struct EventRouter {
    registry: Arc<TaskRegistry>,
    table: Arc<RuleTable>,
}

impl EventRouter {
    pub fn new(registry: Arc<TaskRegistry>, table: Arc<RuleTable>) -> Self {
        Self { registry, table }
    }

    /// Start consuming on a background task until `stop` fires. Events already
    /// queued when the stop signal arrives are still processed.
    pub fn spawn(
        self,
        events: EventReceiver,
        stop: CancellationToken,
    ) -> JoinHandle<Result<RouterReport>> {
        tokio::spawn(async move { self.run(events, stop).await })
    }

    pub async fn run(
        self,
        mut events: EventReceiver,
        stop: CancellationToken,
    ) -> Result<RouterReport> {
        let mut report = RouterReport::default();
        loop {
            tokio::select! {
                biased;
                next = events.recv() => match next {
                    Some((event, ack)) => {
                        self.dispatch(&event, &mut report).await?;
                        ack.ack();
                    }
                    None => break,
                },
                _ = stop.cancelled() => {
                    while let Some((event, ack)) = events.try_recv() {
                        self.dispatch(&event, &mut report).await?;
                        ack.ack();
                    }
                    break;
                }
            }
        }
        debug!(forwarded = report.forwarded, dropped = report.dropped, "event router stopped");
        Ok(report)
    }

    async fn dispatch(&self, event: &RuleEvent, report: &mut RouterReport) -> Result<()> {
        let task = match self.table.route(event.target()) {
            Route::Task(task) => task,
            Route::Phony => {
                report.dropped += 1;
                return Ok(());
            }
            Route::Unknown => {
                warn!(
                    rule = event.target(),
                    event = event.name(),
                    "event for untracked rule"
                );
                report.dropped += 1;
                return Ok(());
            }
        };

        debug!(
            task = %task,
            rule = event.target(),
            event = event.name(),
            "routing rule event"
        );
        match event {
            RuleEvent::Started(_) => self.registry.mark_started(task).await?,
            RuleEvent::Ended(_) => self.registry.mark_ended(task).await?,
            RuleEvent::Succeeded(_) => self.registry.mark_succeeded(task).await?,
            RuleEvent::Failed { cause, .. } => {
                warn!(task = %task, rule = event.target(), cause = %cause, "rule failed");
                self.registry.mark_failed(task).await?
            }
        }
        report.forwarded += 1;
        Ok(())
    }
}
