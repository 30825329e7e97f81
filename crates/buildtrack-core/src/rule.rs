//! Dependency-graph contracts: rules, target sets, and the execution driver.

use crate::error::Result;
use crate::event::EventSender;
use crate::output::RuleOutputFactory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Target name of the top-level grouping rule.
pub const PHONY_ALL: &str = "all";

/// A named, typed grouping of source code (e.g. a package).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceUnit {
    #[serde(rename = "type")]
    pub unit_type: String,
    pub name: String,
}

impl SourceUnit {
    pub fn new(unit_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            unit_type: unit_type.into(),
            name: name.into(),
        }
    }
}

/// What a rule contributes to its task's label.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelParts {
    /// Kind of analysis data the rule produces (`graph`, `depresolve`, ...).
    pub data_kind: Option<String>,
    pub source_unit: Option<SourceUnit>,
}

impl LabelParts {
    /// `"<kind>: <type> <name>"`, or whichever piece is known.
    pub fn label(&self) -> Option<String> {
        let unit = self
            .source_unit
            .as_ref()
            .map(|u| format!("{} {}", u.unit_type, u.name));
        match (self.data_kind.as_deref(), unit) {
            (Some(kind), Some(unit)) => Some(format!("{kind}: {unit}")),
            (Some(kind), None) => Some(kind.to_string()),
            (None, Some(unit)) => Some(unit),
            (None, None) => None,
        }
    }
}

/// A node in the dependency graph.
pub trait Rule: Send + Sync + std::fmt::Debug {
    fn target(&self) -> &str;

    /// Targets this rule depends on.
    fn prereqs(&self) -> &[String] {
        &[]
    }

    /// Phony rules only group other rules; they are never tracked or logged on their own.
    fn is_phony(&self) -> bool {
        self.target() == PHONY_ALL
    }

    fn label_parts(&self) -> LabelParts {
        LabelParts::default()
    }
}

/// Inputs to the graph engine's configuration step.
#[derive(Clone, Debug, Default)]
pub struct GraphOptions {
    pub repo: String,
    pub commit_id: String,
    /// Repository working tree.
    pub workdir: PathBuf,
    /// Extra environment for rule recipes.
    pub env: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Maximum rules executing at once.
    pub parallelism: usize,
    /// Report each rule's commands into its output.
    pub verbose: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            verbose: true,
        }
    }
}

/// A configured dependency graph for one working tree.
#[async_trait::async_trait]
pub trait BuildGraph: Send + Sync {
    /// Default root target.
    fn root(&self) -> &str;

    /// Look a target up in the graph's rule index.
    fn rule(&self, target: &str) -> Option<Arc<dyn Rule>>;

    /// Ordered batches of targets whose prerequisites are satisfied by
    /// earlier batches. Targets within a batch may run concurrently.
    async fn target_sets(&self) -> Result<Vec<Vec<String>>>;

    /// Execute the graph, reporting every rule transition on `events` and
    /// writing rule output to the streams from `outputs`.
    async fn run(
        &self,
        options: &RunOptions,
        events: EventSender,
        outputs: Arc<dyn RuleOutputFactory>,
    ) -> Result<()>;
}

/// Materializes a dependency graph for a repository working tree.
#[async_trait::async_trait]
pub trait GraphEngine: Send + Sync {
    async fn configure(&self, options: &GraphOptions) -> Result<Arc<dyn BuildGraph>>;
}
