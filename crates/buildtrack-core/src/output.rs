//! Rule output sinks.

use crate::error::Result;
use crate::rule::Rule;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

enum SinkTarget {
    File(tokio::fs::File),
    Stderr(tokio::io::Stderr),
    Memory(Vec<u8>),
}

/// Cloneable handle to a log destination. Clones share the same destination;
/// writes are serialized and flushed one at a time.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Mutex<SinkTarget>>,
}

impl LogSink {
    fn from_target(target: SinkTarget) -> Self {
        Self {
            inner: Arc::new(Mutex::new(target)),
        }
    }

    /// Pass-through sink on the process's standard error.
    pub fn stderr() -> Self {
        Self::from_target(SinkTarget::Stderr(tokio::io::stderr()))
    }

    /// In-memory sink, readable with [`LogSink::contents`].
    pub fn memory() -> Self {
        Self::from_target(SinkTarget::Memory(Vec::new()))
    }

    /// Create (or truncate) a log file.
    pub async fn create_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self::from_target(SinkTarget::File(file)))
    }

    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut target = self.inner.lock().await;
        match &mut *target {
            SinkTarget::File(f) => {
                f.write_all(buf).await?;
                f.flush().await?;
            }
            SinkTarget::Stderr(e) => {
                e.write_all(buf).await?;
                e.flush().await?;
            }
            SinkTarget::Memory(v) => v.extend_from_slice(buf),
        }
        Ok(())
    }

    /// Write one log line, adding the trailing newline.
    pub async fn line(&self, msg: impl AsRef<str>) -> Result<()> {
        let mut line = msg.as_ref().to_string();
        line.push('\n');
        self.write_all(line.as_bytes()).await
    }

    /// Bytes written so far. Empty for file and stderr sinks.
    pub async fn contents(&self) -> Vec<u8> {
        match &*self.inner.lock().await {
            SinkTarget::Memory(v) => v.clone(),
            _ => Vec::new(),
        }
    }

    /// Whether both handles point at the same destination.
    pub fn same_sink(&self, other: &LogSink) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").finish_non_exhaustive()
    }
}

/// Streams handed to a rule for the duration of its execution.
#[derive(Clone, Debug)]
pub struct RuleOutput {
    pub out: LogSink,
    pub err: LogSink,
}

impl RuleOutput {
    /// Route both streams to one sink.
    pub fn single(sink: LogSink) -> Self {
        Self {
            out: sink.clone(),
            err: sink,
        }
    }

    /// Diagnostic line from the engine about this rule (commands, exit codes).
    pub async fn log(&self, msg: impl AsRef<str>) -> Result<()> {
        self.err.line(msg).await
    }
}

/// Hands out output streams per rule. Called by the graph engine right before
/// a rule starts.
#[async_trait::async_trait]
pub trait RuleOutputFactory: Send + Sync {
    async fn rule_output(&self, rule: &dyn Rule) -> Result<RuleOutput>;
}
