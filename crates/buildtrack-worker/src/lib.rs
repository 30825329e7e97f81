//! buildtrack worker - turns a build's dependency graph into tracked tasks,
//! runs it, and publishes the resulting analysis data.

pub mod config;
pub mod driver;
pub mod import;
pub mod local;
pub mod logs;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod router;

pub use config::{PathOverrides, WorkerConfig};
pub use driver::{stdout_announcer, Announcer, Execution, GraphDriver};
pub use import::{FileImporter, ImportFinalizer};
pub use logs::{LocalFsLogs, LogMux, MemoryLogs};
pub use orchestrator::{BuildReport, BuildRequest, Orchestrator, OrchestratorConfig, Services};
pub use plan::TaskPlan;
pub use registry::{RetryPolicy, TaskRegistry};
pub use router::{EventRouter, RouterReport, RuleTable};
