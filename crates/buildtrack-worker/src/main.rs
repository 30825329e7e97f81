//! buildtrack CLI: run one build against the local adapters.

use buildtrack_core::{Build, Repo, TrackingService};
use buildtrack_worker::local::{DirBuildData, DirStore, LocalGraphEngine, LocalTracker};
use buildtrack_worker::{
    BuildRequest, FileImporter, LocalFsLogs, Orchestrator, OrchestratorConfig, PathOverrides,
    Services, WorkerConfig,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "buildtrack", version = env!("CARGO_PKG_VERSION"), about = "Run a repository build as tracked, individually logged tasks")]
struct Cli {
    /// Repository URI (e.g. github.com/acme/widgets)
    #[arg(short, long)]
    repo: String,

    /// Build number
    #[arg(short, long)]
    id: u64,

    /// Commit the build resolved to
    #[arg(short, long)]
    commit: String,

    /// Requested revision; defaults to the commit
    #[arg(long)]
    rev: Option<String>,

    /// Repository working tree
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,

    /// Config file (default ~/.buildtrack/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Rules to run at once
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Where per-task log files go
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Where task manifests and update journals go
    #[arg(long)]
    runs_dir: Option<PathBuf>,

    /// Build data root, one directory per commit
    #[arg(long)]
    build_data_dir: Option<PathBuf>,

    /// Analysis store root
    #[arg(long)]
    store_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "buildtrack_worker=info,buildtrack_core=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = WorkerConfig::load(cli.config.as_deref()).await?;
    if let Some(parallel) = cli.parallel {
        anyhow::ensure!(parallel >= 1, "--parallel must be at least 1");
        config.run.parallelism = parallel;
    }
    config.paths.apply(PathOverrides {
        log_dir: cli.log_dir,
        runs_dir: cli.runs_dir,
        build_data_dir: cli.build_data_dir,
        store_dir: cli.store_dir,
    });

    let workdir = cli.workdir.canonicalize().unwrap_or(cli.workdir);
    let build = Build {
        repo: cli.repo.clone(),
        id: cli.id,
        rev: cli.rev.unwrap_or_else(|| cli.commit.clone()),
        commit_id: cli.commit,
    };
    let tracker = Arc::new(
        LocalTracker::persistent(&config.paths.runs_dir)
            .with_build(build.clone(), Repo::new(cli.repo.as_str())),
    );
    let tracker_service: Arc<dyn TrackingService> = tracker.clone();

    let services = Services {
        tracker: tracker_service,
        engine: Arc::new(LocalGraphEngine::new(config.toolchain.buildfile.as_str())),
        logs: Arc::new(LocalFsLogs::new(&config.paths.log_dir)),
        build_data: Arc::new(DirBuildData::new(&config.paths.build_data_dir)),
        store: Arc::new(DirStore::new(&config.paths.store_dir)),
        importer: Arc::new(FileImporter),
    };
    let orchestrator = Orchestrator::new(
        services,
        OrchestratorConfig {
            run: config.run_options(),
            retry: config.retry_policy(),
            workdir,
            env: config.recipe_env(),
        },
    );

    let request = BuildRequest::new(cli.repo.as_str(), cli.id);
    match orchestrator.run(&request).await {
        Ok(report) => {
            println!();
            println!("build {}", report.build);
            for task in tracker.tasks(&report.build.spec()).await {
                println!(
                    "  {:>3}  {:<9}  {}",
                    task.spec.id,
                    task.outcome().to_string(),
                    task.label
                );
            }
            if let Some(err) = &report.graph_error {
                println!("graph errors (import ran anyway): {err}");
            }
            if let Some(dir) = tracker.run_dir(&report.build.spec()) {
                println!("manifest: {}", dir.join("tasks.yaml").display());
            }
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            tracing::error!(build = %build, error = %e, "FATAL: aborting build");
            eprintln!("FATAL: {e}");
            std::process::exit(2);
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("build {build} failed"))),
    }
}
