//! Orchestration tests: task planning, lifecycle mirroring, best-effort import

use async_trait::async_trait;
use buildtrack_core::*;
use buildtrack_worker::local::{DirBuildData, DirStore, LocalGraphEngine, LocalTracker};
use buildtrack_worker::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const REPO: &str = "github.com/acme/widgets";
const COMMIT: &str = "c0ffee";

fn build() -> Build {
    Build {
        repo: REPO.into(),
        id: 7,
        rev: "main".into(),
        commit_id: COMMIT.into(),
    }
}

fn request() -> BuildRequest {
    BuildRequest::new(REPO, 7)
}

// ===========================================================================
// Fakes
// ===========================================================================

#[derive(Debug)]
struct FakeRule {
    target: String,
    phony: bool,
    parts: LabelParts,
}

impl FakeRule {
    fn data(target: &str, kind: &str, unit: Option<(&str, &str)>) -> Self {
        Self {
            target: target.into(),
            phony: false,
            parts: LabelParts {
                data_kind: Some(kind.into()),
                source_unit: unit.map(|(t, n)| SourceUnit::new(t, n)),
            },
        }
    }

    fn bare(target: &str) -> Self {
        Self {
            target: target.into(),
            phony: false,
            parts: LabelParts::default(),
        }
    }

    fn phony(target: &str) -> Self {
        Self {
            target: target.into(),
            phony: true,
            parts: LabelParts::default(),
        }
    }
}

impl Rule for FakeRule {
    fn target(&self) -> &str {
        &self.target
    }

    fn is_phony(&self) -> bool {
        self.phony
    }

    fn label_parts(&self) -> LabelParts {
        self.parts.clone()
    }
}

/// Replays a fixed schedule: every rule starts, ends, then succeeds or fails.
#[derive(Default)]
struct ScriptedGraph {
    sets: Vec<Vec<String>>,
    rules: HashMap<String, Arc<FakeRule>>,
    failing: HashSet<String>,
    /// Targets that get events without being part of any set.
    ghosts: Vec<String>,
}

impl ScriptedGraph {
    fn new() -> Self {
        Self::default()
    }

    fn set(mut self, rules: Vec<FakeRule>) -> Self {
        let mut set = Vec::new();
        for rule in rules {
            set.push(rule.target.clone());
            self.rules.insert(rule.target.clone(), Arc::new(rule));
        }
        self.sets.push(set);
        self
    }

    /// Append a target to the last set without a rule behind it.
    fn unindexed(mut self, target: &str) -> Self {
        match self.sets.last_mut() {
            Some(set) => set.push(target.into()),
            None => self.sets.push(vec![target.into()]),
        }
        self
    }

    fn failing(mut self, target: &str) -> Self {
        self.failing.insert(target.into());
        self
    }

    fn ghost(mut self, target: &str) -> Self {
        self.ghosts.push(target.into());
        self
    }
}

#[async_trait]
impl BuildGraph for ScriptedGraph {
    fn root(&self) -> &str {
        PHONY_ALL
    }

    fn rule(&self, target: &str) -> Option<Arc<dyn Rule>> {
        self.rules.get(target).map(|r| r.clone() as Arc<dyn Rule>)
    }

    async fn target_sets(&self) -> Result<Vec<Vec<String>>> {
        Ok(self.sets.clone())
    }

    async fn run(
        &self,
        _options: &RunOptions,
        events: EventSender,
        outputs: Arc<dyn RuleOutputFactory>,
    ) -> Result<()> {
        let mut failed = Vec::new();
        for target in self.sets.iter().flatten() {
            let Some(rule) = self.rules.get(target) else {
                continue;
            };
            let output = outputs.rule_output(rule.as_ref()).await?;
            output.out.line(format!("building {target}")).await?;
            events.send(RuleEvent::Started(target.clone())).await?;
            events.send(RuleEvent::Ended(target.clone())).await?;
            if self.failing.contains(target) {
                events
                    .send(RuleEvent::Failed {
                        target: target.clone(),
                        cause: "exit status 1".into(),
                    })
                    .await?;
                failed.push(target.clone());
            } else {
                events.send(RuleEvent::Succeeded(target.clone())).await?;
            }
        }
        for ghost in &self.ghosts {
            events.send(RuleEvent::Started(ghost.clone())).await?;
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Graph(failed.join(", ")))
        }
    }
}

struct FakeEngine {
    graph: Arc<ScriptedGraph>,
}

#[async_trait]
impl GraphEngine for FakeEngine {
    async fn configure(&self, _options: &GraphOptions) -> Result<Arc<dyn BuildGraph>> {
        Ok(self.graph.clone())
    }
}

/// Local tracker that counts creations and can misbehave on demand.
struct FakeTracker {
    inner: LocalTracker,
    creates: AtomicUsize,
    failing_updates: AtomicUsize,
    drop_last_task: bool,
}

impl FakeTracker {
    fn new() -> Self {
        Self {
            inner: LocalTracker::new().with_build(build(), Repo::new(REPO)),
            creates: AtomicUsize::new(0),
            failing_updates: AtomicUsize::new(0),
            drop_last_task: false,
        }
    }

    /// Reject the next `n` updates.
    fn failing_updates(self, n: usize) -> Self {
        self.failing_updates.store(n, Ordering::SeqCst);
        self
    }

    fn short_by_one(mut self) -> Self {
        self.drop_last_task = true;
        self
    }
}

#[async_trait]
impl TrackingService for FakeTracker {
    async fn resolve_build(&self, repo: &str, id: u64) -> Result<(Build, Repo)> {
        self.inner.resolve_build(repo, id).await
    }

    async fn create_tasks(&self, build: &BuildSpec, drafts: &[TaskDraft]) -> Result<Vec<Task>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut tasks = self.inner.create_tasks(build, drafts).await?;
        if self.drop_last_task {
            tasks.pop();
        }
        Ok(tasks)
    }

    async fn update_task(&self, task: &TaskRef, update: &TaskUpdate) -> Result<()> {
        let rejected = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(Error::tracking("update task", "service unavailable"));
        }
        self.inner.update_task(task, update).await
    }
}

struct FailingImporter;

#[async_trait]
impl Importer for FailingImporter {
    async fn import(
        &self,
        _data: &dyn BuildDataFs,
        _store: &dyn StoreClient,
        _options: &ImportOptions,
        log: &LogSink,
    ) -> Result<()> {
        log.line("uploading").await?;
        Err(Error::Import("store rejected upload".into()))
    }
}

struct Fixture {
    tracker: Arc<FakeTracker>,
    logs: Arc<MemoryLogs>,
    announced: Arc<Mutex<Vec<String>>>,
    tmp: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self::with_tracker(FakeTracker::new())
    }

    fn with_tracker(tracker: FakeTracker) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let commit_dir = tmp.path().join("data").join(COMMIT);
        std::fs::create_dir_all(&commit_dir).unwrap();
        std::fs::write(commit_dir.join("widgets.graph.json"), "{}").unwrap();
        Self {
            tracker: Arc::new(tracker),
            logs: Arc::new(MemoryLogs::new()),
            announced: Arc::new(Mutex::new(Vec::new())),
            tmp,
        }
    }

    fn store_dir(&self) -> PathBuf {
        self.tmp.path().join("store")
    }

    fn orchestrator(&self, graph: ScriptedGraph, importer: Arc<dyn Importer>) -> Orchestrator {
        let services = Services {
            tracker: self.tracker.clone(),
            engine: Arc::new(FakeEngine {
                graph: Arc::new(graph),
            }),
            logs: self.logs.clone(),
            build_data: Arc::new(DirBuildData::new(self.tmp.path().join("data"))),
            store: Arc::new(DirStore::new(self.store_dir())),
            importer,
        };
        let config = OrchestratorConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
            ..Default::default()
        };
        let announced = self.announced.clone();
        let announcer: Announcer = Arc::new(move |step: &str, dest: &str| {
            announced
                .lock()
                .unwrap()
                .push(format!("{step}: logs at {dest}"))
        });
        Orchestrator::new(services, config).with_announcer(announcer)
    }

    async fn tasks(&self) -> Vec<Task> {
        self.tracker.inner.tasks(&build().spec()).await
    }

    fn creates(&self) -> usize {
        self.tracker.creates.load(Ordering::SeqCst)
    }
}

fn two_rules_and_all() -> ScriptedGraph {
    ScriptedGraph::new()
        .set(vec![
            FakeRule::data("a.graph.json", "graph", Some(("GoPackage", "widgets/a"))),
            FakeRule::data("b.depresolve.json", "depresolve", None),
        ])
        .set(vec![FakeRule::phony(PHONY_ALL)])
}

// ===========================================================================
// Planning
// ===========================================================================

#[tokio::test]
async fn two_rules_and_phony_all_register_three_tasks() {
    let fx = Fixture::new();
    let report = fx
        .orchestrator(two_rules_and_all(), Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap();

    let labels: Vec<_> = report.registered.iter().map(|t| t.label.as_str()).collect();
    assert_eq!(
        labels,
        vec!["graph: GoPackage widgets/a", "depresolve", "import"]
    );
    assert_eq!(fx.creates(), 1);
    assert!(report.graph_error.is_none());

    let tasks = fx.tasks().await;
    assert_eq!(tasks.len(), 3);
    for task in &tasks {
        assert_eq!(task.outcome(), Outcome::Succeeded, "{}", task.label);
        assert!(task.is_terminal());
    }

    // Three events per tracked rule; phony events never reach the registry.
    assert_eq!(report.router.forwarded, 6);
    assert_eq!(report.router.dropped, 3);
    assert_eq!(fx.logs.allocated(), 3);
}

#[tokio::test]
async fn plan_is_enumerated_from_the_graph_root() {
    let plan = TaskPlan::from_graph(&two_rules_and_all(), &build()).await.unwrap();
    assert_eq!(plan.root, PHONY_ALL);
    assert_eq!(plan.phony, vec![PHONY_ALL.to_string()]);
    let targets: Vec<_> = plan.rules.iter().map(|r| r.target.as_str()).collect();
    assert_eq!(targets, vec!["a.graph.json", "b.depresolve.json"]);
}

#[tokio::test]
async fn label_falls_back_to_target() {
    let fx = Fixture::new();
    let graph = ScriptedGraph::new().set(vec![FakeRule::bare("Makefile.out")]);
    let report = fx
        .orchestrator(graph, Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap();
    assert_eq!(report.registered[0].label, "Makefile.out");
}

#[tokio::test]
async fn repeated_target_gets_one_task() {
    let fx = Fixture::new();
    let graph = ScriptedGraph::new()
        .set(vec![FakeRule::data("a.graph.json", "graph", None)])
        .set(vec![
            FakeRule::data("a.graph.json", "graph", None),
            FakeRule::phony(PHONY_ALL),
        ]);
    let report = fx
        .orchestrator(graph, Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap();
    let labels: Vec<_> = report.registered.iter().map(|t| t.label.as_str()).collect();
    assert_eq!(labels, vec!["graph", "import"]);
}

#[tokio::test]
async fn no_actionable_rules_is_fatal_before_create() {
    let fx = Fixture::new();
    let graph = ScriptedGraph::new().set(vec![FakeRule::phony(PHONY_ALL)]);
    let err = fx
        .orchestrator(graph, Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoTasks { .. }), "{err}");
    assert!(err.is_fatal());
    assert_eq!(fx.creates(), 0);
    assert_eq!(fx.logs.allocated(), 0);
}

#[tokio::test]
async fn empty_graph_is_fatal() {
    let fx = Fixture::new();
    let err = fx
        .orchestrator(ScriptedGraph::new(), Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoTasks { .. }));
}

#[tokio::test]
async fn target_without_rule_is_fatal() {
    let fx = Fixture::new();
    let graph = two_rules_and_all().unindexed("ghost.graph.json");
    let err = fx
        .orchestrator(graph, Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MissingRule(ref t) if t == "ghost.graph.json"));
    assert!(err.is_fatal());
    assert_eq!(fx.creates(), 0);
}

#[tokio::test]
async fn short_batch_is_a_count_mismatch() {
    let fx = Fixture::with_tracker(FakeTracker::new().short_by_one());
    let err = fx
        .orchestrator(two_rules_and_all(), Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::TaskCountMismatch {
            sent: 3,
            received: 2
        }
    ));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn unknown_build_fails_to_resolve() {
    let fx = Fixture::new();
    let err = fx
        .orchestrator(two_rules_and_all(), Arc::new(FileImporter))
        .run(&BuildRequest::new(REPO, 99))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Resolve(_)));
}

// ===========================================================================
// Best-effort import
// ===========================================================================

#[tokio::test]
async fn failed_rule_still_imports() {
    let fx = Fixture::new();
    let graph = two_rules_and_all().failing("b.depresolve.json");
    let report = fx
        .orchestrator(graph, Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap();

    assert!(report
        .graph_error
        .as_deref()
        .is_some_and(|e| e.contains("b.depresolve.json")));

    let tasks = fx.tasks().await;
    assert_eq!(tasks[0].outcome(), Outcome::Succeeded);
    assert_eq!(tasks[1].outcome(), Outcome::Failed);
    assert!(!tasks[1].success);
    assert!(tasks[1].started_at.is_some() && tasks[1].ended_at.is_some());
    assert_eq!(tasks[2].label, "import");
    assert_eq!(tasks[2].outcome(), Outcome::Succeeded);

    let sealed = fx
        .store_dir()
        .join("github.com-acme-widgets")
        .join(COMMIT);
    assert!(sealed.join("widgets.graph.json").exists());
    assert!(sealed.join(".complete").exists());
}

#[tokio::test]
async fn import_failure_is_the_result() {
    let fx = Fixture::new();
    let graph = two_rules_and_all().failing("a.graph.json");
    let err = fx
        .orchestrator(graph, Arc::new(FailingImporter))
        .run(&request())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Import(ref m) if m.contains("store rejected")));
    let import = fx.tasks().await.pop().unwrap();
    assert_eq!(import.outcome(), Outcome::Failed);
    assert!(import.is_terminal());

    let sink = fx.logs.sink(&import.spec).unwrap();
    let text = String::from_utf8(sink.contents().await).unwrap();
    assert!(text.starts_with("rule for target: import\n"));
    assert!(text.contains("error: import failed: store rejected upload"));
}

#[tokio::test]
async fn missing_build_data_fails_import_task() {
    let fx = Fixture::new();
    std::fs::remove_dir_all(fx.tmp.path().join("data").join(COMMIT)).unwrap();
    let err = fx
        .orchestrator(two_rules_and_all(), Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::BuildData { ref commit, .. } if commit == COMMIT));
    let import = fx.tasks().await.pop().unwrap();
    assert_eq!(import.outcome(), Outcome::Failed);
}

// ===========================================================================
// Logs and announcements
// ===========================================================================

#[tokio::test]
async fn each_tracked_rule_gets_its_own_sink() {
    let fx = Fixture::new();
    let report = fx
        .orchestrator(two_rules_and_all(), Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap();

    let first = fx.logs.sink(&report.registered[0].spec).unwrap();
    let second = fx.logs.sink(&report.registered[1].spec).unwrap();
    assert!(!first.same_sink(&second));
    assert_eq!(
        String::from_utf8(first.contents().await).unwrap(),
        "rule for target: a.graph.json\nbuilding a.graph.json\n"
    );

    let announced = fx.announced.lock().unwrap().clone();
    assert_eq!(
        announced,
        vec![
            "a.graph.json: logs at mem://github.com-acme-widgets-7-1",
            "b.depresolve.json: logs at mem://github.com-acme-widgets-7-2",
            "import: logs at mem://github.com-acme-widgets-7-3",
        ]
    );
}

#[tokio::test]
async fn events_for_untracked_targets_are_dropped() {
    let fx = Fixture::new();
    let report = fx
        .orchestrator(two_rules_and_all().ghost("stray.graph.json"), Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap();
    assert_eq!(report.router.forwarded, 6);
    assert_eq!(report.router.dropped, 4);
}

// ===========================================================================
// Task sync retries
// ===========================================================================

#[tokio::test]
async fn transient_update_failures_are_retried() {
    let fx = Fixture::with_tracker(FakeTracker::new().failing_updates(2));
    fx.orchestrator(two_rules_and_all(), Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap();

    let tasks = fx.tasks().await;
    assert!(tasks.iter().all(|t| t.outcome() == Outcome::Succeeded));
}

#[tokio::test]
async fn exhausted_retries_abort_the_build() {
    let fx = Fixture::with_tracker(FakeTracker::new().failing_updates(usize::MAX));
    let err = fx
        .orchestrator(two_rules_and_all(), Arc::new(FileImporter))
        .run(&request())
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::SyncFailed { attempts: 3, .. }),
        "{err}"
    );
    assert!(err.is_fatal());
    // Nothing after the first failed update may run, import included.
    assert!(fx.tasks().await.iter().all(|t| t.started_at.is_none()));
}

// ===========================================================================
// Local engine end to end
// ===========================================================================

const BUILDFILE: &str = r#"
rules:
  - target: widgets.graph.json
    prereqs: [widgets.depresolve.json]
    recipe: "echo graphing > widgets.graph.json && echo graphed"
    unit: { type: GoPackage, name: widgets }
  - target: widgets.depresolve.json
    recipe: "echo resolving $BUILDTRACK_REPO"
    unit: { type: GoPackage, name: widgets }
"#;

struct LocalSetup {
    tmp: tempfile::TempDir,
    tracker: Arc<LocalTracker>,
}

impl LocalSetup {
    fn new(buildfile: &str) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/Buildfile.yaml"), buildfile).unwrap();
        let commit_dir = tmp.path().join("data").join(COMMIT);
        std::fs::create_dir_all(&commit_dir).unwrap();
        std::fs::write(commit_dir.join("widgets.graph.json"), "{}").unwrap();

        let tracker = Arc::new(
            LocalTracker::persistent(tmp.path().join("runs")).with_build(build(), Repo::new(REPO)),
        );
        Self { tmp, tracker }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.tmp.path().join(rel)
    }

    async fn run(&self) -> Result<BuildReport> {
        let root: &Path = self.tmp.path();
        let services = Services {
            tracker: self.tracker.clone(),
            engine: Arc::new(LocalGraphEngine::default()),
            logs: Arc::new(LocalFsLogs::new(root.join("logs"))),
            build_data: Arc::new(DirBuildData::new(root.join("data"))),
            store: Arc::new(DirStore::new(root.join("store"))),
            importer: Arc::new(FileImporter),
        };
        let config = OrchestratorConfig {
            run: RunOptions {
                parallelism: 2,
                verbose: true,
            },
            retry: RetryPolicy::fail_fast(),
            workdir: root.join("src"),
            env: WorkerConfig::default().recipe_env(),
        };
        Orchestrator::new(services, config)
            .with_announcer(Arc::new(|_: &str, _: &str| {}))
            .run(&request())
            .await
    }
}

#[tokio::test]
async fn local_build_runs_recipes_and_imports() {
    let setup = LocalSetup::new(BUILDFILE);
    let report = setup.run().await.unwrap();

    let labels: Vec<_> = report.registered.iter().map(|t| t.label.as_str()).collect();
    assert_eq!(
        labels,
        vec![
            "depresolve: GoPackage widgets",
            "graph: GoPackage widgets",
            "import"
        ]
    );
    assert!(report.graph_error.is_none());
    assert!(setup.path("src/widgets.graph.json").exists());

    let log_dir = setup.path("logs/github.com-acme-widgets/7");
    let resolve_log =
        std::fs::read_to_string(log_dir.join("github.com-acme-widgets-7-1.log")).unwrap();
    assert!(resolve_log.starts_with("rule for target: widgets.depresolve.json\n"));
    assert!(resolve_log.contains("resolving github.com/acme/widgets"));
    let graph_log =
        std::fs::read_to_string(log_dir.join("github.com-acme-widgets-7-2.log")).unwrap();
    assert!(graph_log.contains("+ echo graphing"));
    assert!(graph_log.contains("graphed"));
    let import_log =
        std::fs::read_to_string(log_dir.join("github.com-acme-widgets-7-3.log")).unwrap();
    assert!(import_log.contains("import complete: 1 files"));

    let tasks = setup.tracker.tasks(&build().spec()).await;
    assert!(tasks.iter().all(|t| t.outcome() == Outcome::Succeeded));
    assert!(setup
        .path("runs/github.com-acme-widgets/7/tasks.yaml")
        .exists());
    assert!(setup
        .path("store/github.com-acme-widgets/c0ffee/.complete")
        .exists());
}

#[tokio::test]
async fn local_failure_skips_dependents_and_still_imports() {
    let setup = LocalSetup::new(
        r#"
rules:
  - target: widgets.depresolve.json
    recipe: "exit 1"
  - target: widgets.graph.json
    prereqs: [widgets.depresolve.json]
    recipe: "echo never"
  - target: other.unit.json
    recipe: "true"
"#,
    );
    let report = setup.run().await.unwrap();
    assert!(report.graph_error.is_some());

    let tasks = setup.tracker.tasks(&build().spec()).await;
    let by_label: HashMap<_, _> = tasks.iter().map(|t| (t.label.as_str(), t)).collect();
    assert_eq!(by_label["depresolve"].outcome(), Outcome::Failed);
    assert_eq!(by_label["graph"].outcome(), Outcome::Unknown);
    assert!(by_label["graph"].started_at.is_none());
    assert_eq!(by_label["import"].outcome(), Outcome::Succeeded);
}
