//! Turning target sets into task drafts.

use crate::router::RuleTable;
use buildtrack_core::{Build, BuildGraph, Error, Result, Task, TaskDraft};
use std::collections::HashSet;
use tracing::debug;

/// One actionable rule and the draft created for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedRule {
    pub target: String,
    pub draft: TaskDraft,
}

/// Actionable rules in enumeration order, plus the phony targets seen on the way.
#[derive(Clone, Debug, Default)]
pub struct TaskPlan {
    /// Target the graph was enumerated from.
    pub root: String,
    pub rules: Vec<PlannedRule>,
    pub phony: Vec<String>,
}

impl TaskPlan {
    /// Enumerate the graph's target sets. Phony rules get no draft; a target
    /// missing from the graph's rule index, or a plan with nothing to do, is fatal.
    pub async fn from_graph(graph: &dyn BuildGraph, build: &Build) -> Result<Self> {
        let mut plan = Self {
            root: graph.root().to_string(),
            ..Self::default()
        };
        let mut seen = HashSet::new();

        for set in graph.target_sets().await? {
            for target in set {
                let rule = graph
                    .rule(&target)
                    .ok_or_else(|| Error::MissingRule(target.clone()))?;
                if !seen.insert(target.clone()) {
                    debug!(rule = %target, "target listed twice, keeping first");
                    continue;
                }
                if rule.is_phony() {
                    plan.phony.push(target);
                    continue;
                }
                let label = rule.label_parts().label().unwrap_or_else(|| target.clone());
                plan.rules.push(PlannedRule {
                    target,
                    draft: TaskDraft::new(label),
                });
            }
        }

        if plan.rules.is_empty() {
            return Err(Error::NoTasks {
                build: build.to_string(),
            });
        }
        Ok(plan)
    }

    /// Drafts for every rule, followed by the import draft.
    pub fn drafts(&self) -> Vec<TaskDraft> {
        self.rules
            .iter()
            .map(|r| r.draft.clone())
            .chain(std::iter::once(TaskDraft::import()))
            .collect()
    }

    /// Zip created tasks back onto rules by position. `tasks` must be the
    /// result of registering [`TaskPlan::drafts`].
    pub fn table(&self, tasks: &[Task]) -> RuleTable {
        let mut table = RuleTable::new();
        for (rule, task) in self.rules.iter().zip(tasks) {
            table.insert_task(rule.target.as_str(), task.spec.clone());
        }
        for target in &self.phony {
            table.insert_phony(target.as_str());
        }
        table
    }
}
