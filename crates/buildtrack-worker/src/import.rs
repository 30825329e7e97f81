//! Import finalizer: publish the build's analysis data as its own tracked task.

use crate::driver::Announcer;
use crate::logs::LogMux;
use crate::registry::TaskRegistry;
use buildtrack_core::{
    AnalysisStore, Build, BuildDataFs, BuildDataSource, Error, ImportOptions, Importer, LogSink,
    Repo, Result, StoreClient, TaskRef, IMPORT_TASK_LABEL,
};
use std::sync::Arc;
use tracing::{error, info};

pub struct ImportFinalizer {
    registry: Arc<TaskRegistry>,
    logs: Arc<dyn LogMux>,
    announcer: Announcer,
    build_data: Arc<dyn BuildDataSource>,
    store: Arc<dyn AnalysisStore>,
    importer: Arc<dyn Importer>,
    verbose: bool,
}

impl ImportFinalizer {
    pub fn new(
        registry: Arc<TaskRegistry>,
        logs: Arc<dyn LogMux>,
        announcer: Announcer,
        build_data: Arc<dyn BuildDataSource>,
        store: Arc<dyn AnalysisStore>,
        importer: Arc<dyn Importer>,
        verbose: bool,
    ) -> Self {
        Self {
            registry,
            logs,
            announcer,
            build_data,
            store,
            importer,
            verbose,
        }
    }

    /// Import whatever data exists for `build.commit_id`, tracking progress on `task`.
    pub async fn finalize(&self, task: &TaskRef, build: &Build, repo: &Repo) -> Result<()> {
        self.registry.mark_started(task).await?;

        let (sink, destination) = match self.logs.open_sink(task, IMPORT_TASK_LABEL).await {
            Ok(opened) => opened,
            Err(e) => return self.fail(task, None, e).await,
        };
        (self.announcer)(IMPORT_TASK_LABEL, &destination);

        let data = match self.build_data.open(&build.commit_id).await {
            Ok(data) => data,
            Err(e) => {
                let err = Error::build_data(&repo.uri, &build.commit_id, e);
                return self.fail(task, Some(&sink), err).await;
            }
        };

        let client = match self.store.connect().await {
            Ok(client) => client,
            Err(e) => {
                let err = Error::Import(format!("connecting to analysis store: {e}"));
                return self.fail(task, Some(&sink), err).await;
            }
        };

        let options = ImportOptions {
            repo: repo.uri.clone(),
            commit_id: build.commit_id.clone(),
            verbose: self.verbose,
        };
        if let Err(e) = self
            .importer
            .import(data.as_ref(), client.as_ref(), &options, &sink)
            .await
        {
            let err = match e {
                Error::Import(_) => e,
                other => Error::Import(other.to_string()),
            };
            return self.fail(task, Some(&sink), err).await;
        }

        self.registry.mark_ended(task).await?;
        self.registry.mark_succeeded(task).await?;
        info!(task = %task, repo = %repo.uri, commit = %build.commit_id, "import succeeded");
        Ok(())
    }

    async fn fail(&self, task: &TaskRef, sink: Option<&LogSink>, err: Error) -> Result<()> {
        error!(task = %task, error = %err, "import step failed");
        if let Some(sink) = sink {
            let _ = sink.line(format!("error: {err}")).await;
        }
        self.registry.mark_ended(task).await?;
        self.registry.mark_failed(task).await?;
        Err(err)
    }
}

/// Uploads every build-data file, then seals the version.
#[derive(Debug, Default)]
pub struct FileImporter;

#[async_trait::async_trait]
impl Importer for FileImporter {
    async fn import(
        &self,
        data: &dyn BuildDataFs,
        store: &dyn StoreClient,
        options: &ImportOptions,
        log: &LogSink,
    ) -> Result<()> {
        let files = data.list().await?;
        if options.verbose {
            log.line(format!(
                "importing {} files from {} for {}@{}",
                files.len(),
                data.location(),
                options.repo,
                options.commit_id
            ))
            .await?;
        }

        for path in &files {
            let bytes = data.read(path).await?;
            store
                .put(&options.repo, &options.commit_id, path, &bytes)
                .await?;
            if options.verbose {
                log.line(format!("imported {path} ({} bytes)", bytes.len()))
                    .await?;
            }
        }

        store.finish(&options.repo, &options.commit_id).await?;
        log.line(format!("import complete: {} files", files.len()))
            .await
    }
}
