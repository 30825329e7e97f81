//! Worker configuration
//!
//! Loaded from TOML at startup, falls back to defaults if no config file exists.
//! Every section is optional; missing fields take their default.

use crate::registry::RetryPolicy;
use buildtrack_core::{Error, Result, RunOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Recipe environment variable naming the toolchain execution method.
pub const ENV_EXE_METHOD: &str = "BUILDTRACK_EXE_METHOD";
/// Recipe environment variable asking toolchains to fetch dependencies.
pub const ENV_FETCH_DEPS: &str = "BUILDTRACK_FETCH_DEPS";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub run: RunConfig,
    pub toolchain: ToolchainConfig,
    pub paths: PathsConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Rules executing at once. 1 runs the graph sequentially.
    pub parallelism: usize,
    /// Echo recipe commands into each rule's log.
    pub verbose: bool,
}

/// How toolchains are invoked by rule recipes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExeMethod {
    #[default]
    Program,
    Docker,
}

impl ExeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Program => "program",
            Self::Docker => "docker",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub exe_method: ExeMethod,
    /// Let toolchains fetch dependencies while building.
    pub fetch_deps: bool,
    /// Rule file, relative to the repository working tree.
    pub buildfile: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Per-task log files.
    pub log_dir: PathBuf,
    /// Task manifests and update journals.
    pub runs_dir: PathBuf,
    /// Build data, one directory per commit.
    pub build_data_dir: PathBuf,
    /// Analysis store root.
    pub store_dir: PathBuf,
}

/// Directory overrides from the command line. `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub log_dir: Option<PathBuf>,
    pub runs_dir: Option<PathBuf>,
    pub build_data_dir: Option<PathBuf>,
    pub store_dir: Option<PathBuf>,
}

impl PathsConfig {
    pub fn apply(&mut self, overrides: PathOverrides) {
        if let Some(dir) = overrides.log_dir {
            self.log_dir = dir;
        }
        if let Some(dir) = overrides.runs_dir {
            self.runs_dir = dir;
        }
        if let Some(dir) = overrides.build_data_dir {
            self.build_data_dir = dir;
        }
        if let Some(dir) = overrides.store_dir {
            self.store_dir = dir;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per task update, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            verbose: true,
        }
    }
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            exe_method: ExeMethod::Program,
            fetch_deps: true,
            buildfile: "Buildfile.yaml".into(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            log_dir: home.join("logs"),
            runs_dir: home.join("runs"),
            build_data_dir: home.join("build-data"),
            store_dir: home.join("store"),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

/// `~/.buildtrack`, or `/tmp/buildtrack` without a home directory.
pub fn home_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".buildtrack"))
        .unwrap_or_else(|| PathBuf::from("/tmp/buildtrack"))
}

impl WorkerConfig {
    /// Load from `path`, or from `~/.buildtrack/config.toml` when `None`.
    /// A missing file yields the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| home_dir().join("config.toml"));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.run.parallelism == 0 {
            return Err(Error::Config("run.parallelism must be at least 1".into()));
        }
        Ok(())
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            parallelism: self.run.parallelism,
            verbose: self.run.verbose,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    /// Environment handed to every rule recipe.
    pub fn recipe_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            ENV_EXE_METHOD.to_string(),
            self.toolchain.exe_method.as_str().to_string(),
        );
        if self.toolchain.fetch_deps {
            env.insert(ENV_FETCH_DEPS.to_string(), "t".to_string());
        }
        env
    }
}
