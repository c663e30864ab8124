//! Core sandbox data types: requests, results, limits and statistics.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Why an execution finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Process exited on its own (any exit code)
    Completed,
    /// Wall-clock deadline fired before the process exited
    Timeout,
    /// Caller cancelled the execution via `kill`
    Killed,
    /// Memory-cap kill, when the backend can distinguish it
    Oom,
    /// Toolchain rejected the source
    CompileError,
    /// Backend failure (spawn error, container runtime error, ...)
    InternalError,
}

/// Which execution backend runs a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Process,
    Container,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Container => write!(f, "container"),
        }
    }
}

/// Resource caps applied to a single execution.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Peak address-space cap in bytes (0 = backend default)
    #[serde(default)]
    pub memory_bytes: u64,
    /// CPU quota in microseconds per 100ms period (0 = backend default)
    #[serde(default)]
    pub cpu_quota: i64,
}

/// A request to run user-submitted source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Language tag or alias ("python", "py", "c++", ...)
    pub language: String,
    /// Submitted source bytes
    pub source: String,
    /// Bytes piped to the process on stdin
    #[serde(default)]
    pub stdin: Vec<u8>,
    /// Extra arguments appended to the run argv
    #[serde(default)]
    pub argv: Vec<String>,
    /// Wall-clock cap; `None` uses the backend default
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Resource caps; `None` uses the backend defaults
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
    /// Pin the request to a backend; `None` lets the façade choose
    #[serde(default)]
    pub backend: Option<BackendKind>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: Vec::new(),
            argv: Vec::new(),
            timeout: None,
            limits: None,
            backend: None,
        }
    }

    pub fn on_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// A request to run an existing file.
#[derive(Debug, Clone)]
pub struct FileExecutionRequest {
    /// Path of the file to run
    pub path: PathBuf,
    /// Full argv to run verbatim; empty infers the language from the
    /// file extension and builds the argv from its recipe
    pub argv: Vec<String>,
    pub stdin: Vec<u8>,
    pub timeout: Option<Duration>,
    pub limits: Option<ResourceLimits>,
}

impl FileExecutionRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            argv: Vec::new(),
            stdin: Vec::new(),
            timeout: None,
            limits: None,
        }
    }
}

/// Outcome of one execution. The wire payload of the execution API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Best-effort peak memory; 0 if not measured
    pub memory_bytes: u64,
    pub termination: Termination,
    /// Compiler or backend diagnostics, when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl ExecutionResult {
    /// Result for failures that never produced a process.
    pub fn internal_error(diag: impl Into<String>) -> Self {
        let diag = diag.into();
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: diag.clone(),
            duration_ms: 0,
            memory_bytes: 0,
            termination: Termination::InternalError,
            diagnostics: Some(diag),
        }
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Completed && self.exit_code == 0
    }
}

/// Errors surfaced by the sandbox layer.
///
/// `execute` on the façade never returns these to callers; they are folded
/// into an [`ExecutionResult`] with an `internal_error` termination. They do
/// surface from construction and from `kill`.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Language, toolchain or image missing
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Caller supplied an unacceptable input
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No execution with this id is currently running
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// Container backend required but unavailable
    #[error("container backend unavailable: {0}")]
    ContainerUnavailable(String),

    /// Subprocess or runtime failure
    #[error("backend failure: {0}")]
    Backend(String),

    /// I/O error while preparing or cleaning the scratch directory
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "containers")]
    #[error("container error: {0}")]
    Container(#[from] crate::container::ContainerError),
}

/// Monotonic execution counters plus the in-flight gauge.
///
/// Invariant: completed + failed + timed_out + killed + in-flight == started.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    pub started: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub killed: AtomicU64,
    pub in_flight: AtomicU64,
    pub high_water: AtomicU64,
}

impl ExecutionStats {
    pub fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.high_water.fetch_max(now, Ordering::Relaxed);
    }

    pub fn record_finish(&self, termination: Termination) {
        match termination {
            Termination::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            Termination::Timeout => self.timed_out.fetch_add(1, Ordering::Relaxed),
            Termination::Killed => self.killed.fetch_add(1, Ordering::Relaxed),
            Termination::Oom | Termination::CompileError | Termination::InternalError => {
                self.failed.fetch_add(1, Ordering::Relaxed)
            }
        };
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            killed: self.killed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            high_water: self.high_water.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ExecutionStats`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub killed: u64,
    pub in_flight: u64,
    pub high_water: u64,
}

impl StatsSnapshot {
    /// Merge counters from another backend.
    pub fn merge(mut self, other: StatsSnapshot) -> Self {
        self.started += other.started;
        self.completed += other.completed;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.killed += other.killed;
        self.in_flight += other.in_flight;
        self.high_water += other.high_water;
        self
    }
}
