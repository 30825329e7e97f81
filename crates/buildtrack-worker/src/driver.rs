//! Graph execution driver: wires log sinks and the event router into one engine run.

use crate::logs::LogMux;
use crate::registry::TaskRegistry;
use crate::router::{EventRouter, Route, RouterReport, RuleTable};
use buildtrack_core::{
    event_channel, BuildGraph, Error, LogSink, Result, Rule, RuleOutput, RuleOutputFactory,
    RunOptions,
};
use std::sync::Arc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tells the operator where a step's logs go: `(step, destination)`.
pub type Announcer = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Prints `<step>: logs at <destination>` on stdout.
pub fn stdout_announcer() -> Announcer {
    Arc::new(|step: &str, destination: &str| println!("{step}: logs at {destination}"))
}

/// Output streams per rule: an isolated sink for tracked rules, the shared
/// pass-through sink for everything else.
struct WiredOutputs {
    table: Arc<RuleTable>,
    logs: Arc<dyn LogMux>,
    announcer: Announcer,
    passthrough: LogSink,
}

#[async_trait::async_trait]
impl RuleOutputFactory for WiredOutputs {
    async fn rule_output(&self, rule: &dyn Rule) -> Result<RuleOutput> {
        match self.table.route(rule.target()) {
            Route::Task(task) => {
                let (sink, destination) = self.logs.open_sink(task, rule.target()).await?;
                (self.announcer)(rule.target(), &destination);
                Ok(RuleOutput::single(sink))
            }
            Route::Phony => Ok(RuleOutput::single(self.passthrough.clone())),
            Route::Unknown => {
                warn!(rule = rule.target(), "output requested for untracked rule");
                Ok(RuleOutput::single(self.passthrough.clone()))
            }
        }
    }
}

/// Result of one graph run.
#[derive(Debug)]
pub struct Execution {
    /// Error reported by the engine itself. Recorded, never propagated.
    pub graph_error: Option<Error>,
    pub router: RouterReport,
}

type RouterJoin = std::result::Result<Result<RouterReport>, JoinError>;

enum First {
    Run(Result<()>),
    Router(RouterJoin),
}

pub struct GraphDriver {
    registry: Arc<TaskRegistry>,
    table: Arc<RuleTable>,
    logs: Arc<dyn LogMux>,
    announcer: Announcer,
    options: RunOptions,
}

impl GraphDriver {
    pub fn new(
        registry: Arc<TaskRegistry>,
        table: Arc<RuleTable>,
        logs: Arc<dyn LogMux>,
        announcer: Announcer,
        options: RunOptions,
    ) -> Self {
        Self {
            registry,
            table,
            logs,
            announcer,
            options,
        }
    }

    /// Run the graph to completion with the router consuming its events.
    ///
    /// Returns `Err` only when the router failed to mirror an update; an engine
    /// error is handed back in [`Execution::graph_error`].
    pub async fn execute(&self, graph: &dyn BuildGraph) -> Result<Execution> {
        let (events, receiver) = event_channel();
        let stop = CancellationToken::new();
        let mut router = EventRouter::new(self.registry.clone(), self.table.clone())
            .spawn(receiver, stop.clone());

        let outputs: Arc<dyn RuleOutputFactory> = Arc::new(WiredOutputs {
            table: self.table.clone(),
            logs: self.logs.clone(),
            announcer: self.announcer.clone(),
            passthrough: LogSink::stderr(),
        });

        info!(
            parallelism = self.options.parallelism,
            verbose = self.options.verbose,
            tasks = self.table.task_count(),
            "running graph"
        );
        let run = graph.run(&self.options, events, outputs);
        tokio::pin!(run);

        let first = tokio::select! {
            result = &mut run => First::Run(result),
            joined = &mut router => First::Router(joined),
        };

        match first {
            First::Run(result) => {
                // Every event was acknowledged before its send returned, so
                // nothing emitted by the run can be lost by stopping now.
                stop.cancel();
                let report = join_router(router.await)?;
                Ok(Execution {
                    graph_error: result.err(),
                    router: report,
                })
            }
            First::Router(joined) => {
                // An early exit is either a failed update (abort) or the engine
                // dropping its sender before returning.
                let report = join_router(joined)?;
                let result = run.await;
                Ok(Execution {
                    graph_error: result.err(),
                    router: report,
                })
            }
        }
    }
}

fn join_router(joined: RouterJoin) -> Result<RouterReport> {
    joined.map_err(|e| Error::Internal(format!("event router panicked: {e}")))?
}
