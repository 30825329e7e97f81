//! Local graph engine: rules declared in a YAML Buildfile, recipes run as shell commands.
//!
//! ```yaml
//! rules:
//!   - target: widgets.graph.json
//!     prereqs: [widgets.depresolve.json]
//!     recipe: srclib-graph > widgets.graph.json
//!     unit: { type: GoPackage, name: widgets }
//!   - target: widgets.depresolve.json
//!     recipe: srclib-depresolve > widgets.depresolve.json
//! ```
//!
//! Every reachable rule is executed; there is no staleness check. A phony `all`
//! depending on every other rule is added when the file declares none.

use async_trait::async_trait;
use buildtrack_core::{
    BuildGraph, Error, EventSender, GraphEngine, GraphOptions, LabelParts, LogSink, Result, Rule,
    RuleEvent, RuleOutput, RuleOutputFactory, RunOptions, SourceUnit, PHONY_ALL,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Recipe environment variable carrying the repository URI.
pub const ENV_REPO: &str = "BUILDTRACK_REPO";
/// Recipe environment variable carrying the commit being built.
pub const ENV_COMMIT: &str = "BUILDTRACK_COMMIT";

#[derive(Debug, Deserialize)]
struct Buildfile {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    target: String,
    #[serde(default)]
    prereqs: Vec<String>,
    #[serde(default)]
    recipe: Option<String>,
    #[serde(default)]
    phony: bool,
    #[serde(default)]
    data_kind: Option<String>,
    #[serde(default)]
    unit: Option<SourceUnit>,
}

/// `pkg/widgets.depresolve.json` -> `depresolve`
pub fn data_kind_from_target(target: &str) -> Option<String> {
    let name = target.rsplit('/').next().unwrap_or(target);
    let stem = name.strip_suffix(".json")?;
    let (_, kind) = stem.rsplit_once('.')?;
    (!kind.is_empty()).then(|| kind.to_string())
}

#[derive(Debug, Clone)]
pub struct LocalRule {
    target: String,
    prereqs: Vec<String>,
    recipe: Option<String>,
    phony: bool,
    data_kind: Option<String>,
    unit: Option<SourceUnit>,
}

impl LocalRule {
    fn from_spec(spec: RuleSpec) -> Self {
        let data_kind = if spec.phony {
            spec.data_kind
        } else {
            spec.data_kind.or_else(|| data_kind_from_target(&spec.target))
        };
        Self {
            phony: spec.phony || spec.target == PHONY_ALL,
            target: spec.target,
            prereqs: spec.prereqs,
            recipe: spec.recipe,
            data_kind,
            unit: spec.unit,
        }
    }

    fn phony_all(prereqs: Vec<String>) -> Self {
        Self {
            target: PHONY_ALL.into(),
            prereqs,
            recipe: None,
            phony: true,
            data_kind: None,
            unit: None,
        }
    }

    pub fn recipe(&self) -> Option<&str> {
        self.recipe.as_deref()
    }
}

impl Rule for LocalRule {
    fn target(&self) -> &str {
        &self.target
    }

    fn prereqs(&self) -> &[String] {
        &self.prereqs
    }

    fn is_phony(&self) -> bool {
        self.phony
    }

    fn label_parts(&self) -> LabelParts {
        LabelParts {
            data_kind: self.data_kind.clone(),
            source_unit: self.unit.clone(),
        }
    }
}

/// Reads `<workdir>/<buildfile>` on every configure.
pub struct LocalGraphEngine {
    buildfile: String,
}

impl LocalGraphEngine {
    pub fn new(buildfile: impl Into<String>) -> Self {
        Self {
            buildfile: buildfile.into(),
        }
    }
}

impl Default for LocalGraphEngine {
    fn default() -> Self {
        Self::new("Buildfile.yaml")
    }
}

#[async_trait]
impl GraphEngine for LocalGraphEngine {
    async fn configure(&self, options: &GraphOptions) -> Result<Arc<dyn BuildGraph>> {
        let path = options.workdir.join(&self.buildfile);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Configure(format!("reading {}: {e}", path.display())))?;
        let graph = LocalGraph::parse(&raw, options)?;
        info!(
            buildfile = %path.display(),
            rules = graph.rules.len(),
            root = %graph.root,
            "configured local graph"
        );
        Ok(Arc::new(graph))
    }
}

pub struct LocalGraph {
    root: String,
    rules: HashMap<String, Arc<LocalRule>>,
    /// Declaration order, used to keep target sets stable.
    order: Vec<String>,
    workdir: PathBuf,
    env: BTreeMap<String, String>,
}

impl LocalGraph {
    pub fn parse(raw: &str, options: &GraphOptions) -> Result<Self> {
        let file: Buildfile = serde_yaml::from_str(raw)
            .map_err(|e| Error::Configure(format!("parsing buildfile: {e}")))?;

        let mut rules = HashMap::new();
        let mut order = Vec::new();
        for spec in file.rules {
            let rule = LocalRule::from_spec(spec);
            if rules.contains_key(&rule.target) {
                return Err(Error::Configure(format!(
                    "duplicate rule for target {}",
                    rule.target
                )));
            }
            order.push(rule.target.clone());
            rules.insert(rule.target.clone(), Arc::new(rule));
        }

        if !rules.contains_key(PHONY_ALL) {
            let prereqs: Vec<String> = order
                .iter()
                .filter(|t| rules.get(*t).is_some_and(|r| !r.phony))
                .cloned()
                .collect();
            order.push(PHONY_ALL.into());
            rules.insert(PHONY_ALL.into(), Arc::new(LocalRule::phony_all(prereqs)));
        }

        for rule in rules.values() {
            for prereq in &rule.prereqs {
                if !rules.contains_key(prereq) && !options.workdir.join(prereq).exists() {
                    return Err(Error::Configure(format!(
                        "no rule to make {prereq}, needed by {}",
                        rule.target
                    )));
                }
            }
        }

        let root = file.default.unwrap_or_else(|| PHONY_ALL.into());
        if !rules.contains_key(&root) {
            return Err(Error::Configure(format!("default target {root} has no rule")));
        }

        let mut env = options.env.clone();
        env.insert(ENV_REPO.into(), options.repo.clone());
        env.insert(ENV_COMMIT.into(), options.commit_id.clone());

        Ok(Self {
            root,
            rules,
            order,
            workdir: options.workdir.clone(),
            env,
        })
    }

    /// Rules reachable from the root, grouped by depth: a rule lands one set
    /// after its deepest prerequisite. Prerequisites that are plain files don't count.
    fn layers(&self) -> Result<Vec<Vec<String>>> {
        let mut depth: HashMap<String, usize> = HashMap::new();
        let mut visiting = HashSet::new();
        self.visit(&self.root, &mut depth, &mut visiting)?;

        let mut sets: Vec<Vec<String>> = Vec::new();
        for target in &self.order {
            if let Some(&d) = depth.get(target) {
                if sets.len() <= d {
                    sets.resize_with(d + 1, Vec::new);
                }
                sets[d].push(target.clone());
            }
        }
        Ok(sets)
    }

    fn visit(
        &self,
        target: &str,
        depth: &mut HashMap<String, usize>,
        visiting: &mut HashSet<String>,
    ) -> Result<usize> {
        if let Some(&d) = depth.get(target) {
            return Ok(d);
        }
        if !visiting.insert(target.to_string()) {
            return Err(Error::Configure(format!("dependency cycle through {target}")));
        }
        let mut d = 0;
        if let Some(rule) = self.rules.get(target) {
            for prereq in rule.prereqs.iter().filter(|p| self.rules.contains_key(*p)) {
                d = d.max(self.visit(prereq, depth, visiting)? + 1);
            }
        }
        visiting.remove(target);
        depth.insert(target.to_string(), d);
        Ok(d)
    }
}

#[async_trait]
impl BuildGraph for LocalGraph {
    fn root(&self) -> &str {
        &self.root
    }

    fn rule(&self, target: &str) -> Option<Arc<dyn Rule>> {
        self.rules
            .get(target)
            .map(|r| r.clone() as Arc<dyn Rule>)
    }

    async fn target_sets(&self) -> Result<Vec<Vec<String>>> {
        self.layers()
    }

    async fn run(
        &self,
        options: &RunOptions,
        events: EventSender,
        outputs: Arc<dyn RuleOutputFactory>,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(options.parallelism.max(1)));
        let mut unusable: HashSet<String> = HashSet::new();
        let mut failed = Vec::new();

        for set in self.layers()? {
            let mut running = JoinSet::new();
            for target in set {
                let Some(rule) = self.rules.get(&target).cloned() else {
                    continue;
                };
                if let Some(p) = rule.prereqs.iter().find(|p| unusable.contains(*p)) {
                    warn!(rule = %target, prereq = %p, "skipping rule, prerequisite failed");
                    unusable.insert(target);
                    continue;
                }
                let job = RuleJob {
                    rule,
                    workdir: self.workdir.clone(),
                    env: self.env.clone(),
                    verbose: options.verbose,
                    events: events.clone(),
                    outputs: outputs.clone(),
                    semaphore: semaphore.clone(),
                };
                running.spawn(job.execute());
            }

            while let Some(joined) = running.join_next().await {
                let (target, succeeded) = joined
                    .map_err(|e| Error::Internal(format!("rule task panicked: {e}")))??;
                if !succeeded {
                    unusable.insert(target.clone());
                    failed.push(target);
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            failed.sort();
            Err(Error::Graph(format!("rules failed: {}", failed.join(", "))))
        }
    }
}

struct RuleJob {
    rule: Arc<LocalRule>,
    workdir: PathBuf,
    env: BTreeMap<String, String>,
    verbose: bool,
    events: EventSender,
    outputs: Arc<dyn RuleOutputFactory>,
    semaphore: Arc<Semaphore>,
}

impl RuleJob {
    /// `Ok((target, false))` is a failed recipe; `Err` means the run itself can't go on.
    async fn execute(self) -> Result<(String, bool)> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("rule semaphore closed".into()))?;
        let target = self.rule.target.clone();

        let output = self.outputs.rule_output(self.rule.as_ref()).await?;
        self.events.send(RuleEvent::Started(target.clone())).await?;
        let result = match self.rule.recipe() {
            Some(recipe) => self.run_recipe(recipe, &output).await,
            None => Ok(()),
        };
        self.events.send(RuleEvent::Ended(target.clone())).await?;

        match result {
            Ok(()) => {
                self.events.send(RuleEvent::Succeeded(target.clone())).await?;
                Ok((target, true))
            }
            Err(cause) => {
                let _ = output.log(format!("error: {cause}")).await;
                self.events
                    .send(RuleEvent::Failed {
                        target: target.clone(),
                        cause,
                    })
                    .await?;
                Ok((target, false))
            }
        }
    }

    async fn run_recipe(&self, recipe: &str, output: &RuleOutput) -> std::result::Result<(), String> {
        if self.verbose {
            output
                .log(format!("+ {recipe}"))
                .await
                .map_err(|e| e.to_string())?;
        }
        debug!(rule = %self.rule.target, "running recipe");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(recipe)
            .current_dir(&self.workdir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("spawning recipe: {e}"))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (out, err, status) = tokio::join!(
            pump(stdout, &output.out),
            pump(stderr, &output.err),
            child.wait()
        );
        out.and(err).map_err(|e| format!("writing rule output: {e}"))?;
        let status = status.map_err(|e| format!("waiting for recipe: {e}"))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("recipe exited with {status}"))
        }
    }
}

async fn pump(pipe: Option<impl AsyncRead + Unpin>, sink: &LogSink) -> Result<()> {
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    let mut buf = [0u8; 8192];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.write_all(&buf[..n]).await?;
    }
}
