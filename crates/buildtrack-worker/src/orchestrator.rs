//! Build orchestrator: sequences task planning, registration, graph execution
//! and the import step for one build.

use crate::driver::{stdout_announcer, Announcer, GraphDriver};
use crate::import::ImportFinalizer;
use crate::logs::LogMux;
use crate::plan::TaskPlan;
use crate::registry::{RetryPolicy, TaskRegistry};
use crate::router::RouterReport;
use buildtrack_core::{
    AnalysisStore, Build, BuildDataSource, Error, GraphEngine, GraphOptions, Importer, Repo,
    Result, RunOptions, Task, TrackingService,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Every collaborator the orchestrator talks to.
#[derive(Clone)]
pub struct Services {
    pub tracker: Arc<dyn TrackingService>,
    pub engine: Arc<dyn GraphEngine>,
    pub logs: Arc<dyn LogMux>,
    pub build_data: Arc<dyn BuildDataSource>,
    pub store: Arc<dyn AnalysisStore>,
    pub importer: Arc<dyn Importer>,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub run: RunOptions,
    pub retry: RetryPolicy,
    /// Repository working tree handed to the graph engine.
    pub workdir: PathBuf,
    /// Extra environment for rule recipes.
    pub env: BTreeMap<String, String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            run: RunOptions::default(),
            retry: RetryPolicy::default(),
            workdir: PathBuf::from("."),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildRequest {
    pub repo: String,
    pub build_id: u64,
}

impl BuildRequest {
    pub fn new(repo: impl Into<String>, build_id: u64) -> Self {
        Self {
            repo: repo.into(),
            build_id,
        }
    }
}

/// Outcome of a build whose import step succeeded.
#[derive(Clone, Debug)]
pub struct BuildReport {
    pub build: Build,
    pub repo: Repo,
    /// Tasks as created, in registration order. The import task is last.
    pub registered: Vec<Task>,
    /// Engine error absorbed before the import step.
    pub graph_error: Option<String>,
    pub router: RouterReport,
}

pub struct Orchestrator {
    services: Services,
    config: OrchestratorConfig,
    announcer: Announcer,
}

impl Orchestrator {
    pub fn new(services: Services, config: OrchestratorConfig) -> Self {
        Self {
            services,
            config,
            announcer: stdout_announcer(),
        }
    }

    pub fn with_announcer(mut self, announcer: Announcer) -> Self {
        self.announcer = announcer;
        self
    }

    /// Run one build end to end.
    ///
    /// A failing graph never stops the import; the import step's own error is
    /// what this returns. Fatal errors ([`Error::is_fatal`]) abort earlier.
    pub async fn run(&self, request: &BuildRequest) -> Result<BuildReport> {
        let (build, repo) = self
            .services
            .tracker
            .resolve_build(&request.repo, request.build_id)
            .await?;
        info!(build = %build, "resolved build");

        let graph = self
            .services
            .engine
            .configure(&GraphOptions {
                repo: repo.uri.clone(),
                commit_id: build.commit_id.clone(),
                workdir: self.config.workdir.clone(),
                env: self.config.env.clone(),
            })
            .await?;

        let plan = TaskPlan::from_graph(graph.as_ref(), &build).await?;
        let drafts = plan.drafts();

        let registry = Arc::new(TaskRegistry::new(
            self.services.tracker.clone(),
            build.spec(),
            self.config.retry.clone(),
        ));
        let registered = registry.register(&drafts).await?;
        let import_task = registered
            .last()
            .map(|t| t.spec.clone())
            .ok_or_else(|| Error::Internal("import task missing from registration".into()))?;
        info!(
            build = %build,
            root = %plan.root,
            rules = plan.rules.len(),
            phony = plan.phony.len(),
            "registered tasks"
        );

        let table = Arc::new(plan.table(&registered));
        let driver = GraphDriver::new(
            registry.clone(),
            table,
            self.services.logs.clone(),
            self.announcer.clone(),
            self.config.run.clone(),
        );
        let execution = driver.execute(graph.as_ref()).await?;

        let graph_error = execution.graph_error.map(|e| {
            warn!(build = %build, error = %e, "there was an error building the code");
            warn!(build = %build, "proceeding with best-effort import");
            e.to_string()
        });

        ImportFinalizer::new(
            registry,
            self.services.logs.clone(),
            self.announcer.clone(),
            self.services.build_data.clone(),
            self.services.store.clone(),
            self.services.importer.clone(),
            self.config.run.verbose,
        )
        .finalize(&import_task, &build, &repo)
        .await?;

        info!(build = %build, "build finished");
        Ok(BuildReport {
            build,
            repo,
            registered,
            graph_error,
            router: execution.router,
        })
    }
}
