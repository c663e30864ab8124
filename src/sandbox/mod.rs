//! # Sandboxed Code Execution Engine
//!
//! Runs untrusted user code in one of ten languages with resource limits,
//! timeouts and optional container isolation.
//!
//! ## Core Components
//!
//! - **[`SandboxService`]**: Public façade. Selects a backend per request
//!   (container preferred, process fallback), owns the global concurrency
//!   gate, the active-execution table and aggregated statistics.
//! - **[`ProcessBackend`]**: Child-process execution in per-execution
//!   scratch directories with soft-then-hard termination.
//! - **[`ContainerBackend`]**: Single-use hardened containers with bind
//!   mounted scratch directories (requires the `containers` feature).
//! - **[`RunnerRegistry`]**: Language tag → immutable build+run recipe.
//!
//! ## Execution Flow
//!
//! ```text
//! ExecutionRequest
//!        ↓
//!   SandboxService::execute()
//!        ↓  (semaphore gate, active table)
//!   ┌────┴────┐
//!   │         │
//! Process  Container
//!   │         │
//!   └────┬────┘
//!        ↓
//!  ExecutionResult  (never an error across `execute`)
//! ```
//!
//! The façade never throws across `execute`: backend failures become a
//! well-formed result with `termination = internal_error`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Language runner registry and recipes.
pub mod recipe;

/// Per-execution scratch directories.
pub mod scratch;

/// Process execution backend.
pub mod process;

/// Container execution backend (requires the `containers` feature).
#[cfg(feature = "containers")]
pub mod container;

/// Sandbox data types: requests, results, limits, stats.
pub mod types;

pub use process::{ProcessBackend, ProcessBackendConfig};
pub use recipe::{Recipe, RunnerRegistry};
pub use scratch::ScratchDir;
pub use types::{
    BackendKind, ExecutionRequest, ExecutionResult, FileExecutionRequest, ResourceLimits,
    SandboxError, StatsSnapshot, Termination,
};

#[cfg(feature = "containers")]
pub use container::{ContainerBackend, ContainerBackendConfig};

use crate::metrics::{SANDBOX_EXEC_INFLIGHT, SANDBOX_EXEC_TOTAL, SharedMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// How many finished execution ids the façade remembers for kill
/// idempotence.
const FINISHED_RING_CAPACITY: usize = 1024;

/// Backend selection policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Attempt the container backend first
    pub prefer_container: bool,
    /// Refuse to start without the container backend
    pub require_container: bool,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            prefer_container: true,
            require_container: false,
        }
    }
}

/// Façade configuration.
#[derive(Debug, Clone, Default)]
pub struct SandboxServiceConfig {
    pub policy: SandboxPolicy,
    /// Global in-flight cap; further calls queue FIFO on the gate
    pub max_concurrent: usize,
    pub process: ProcessBackendConfig,
    #[cfg(feature = "containers")]
    pub container: ContainerBackendConfig,
}

/// Capability report for the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxFacts {
    pub container_available: bool,
    pub seccomp_enabled: bool,
    pub readonly_rootfs: bool,
    pub languages: Vec<String>,
}

/// Active and recently-finished execution ids.
#[derive(Debug, Default)]
struct ActiveTable {
    running: HashMap<String, BackendKind>,
    finished: VecDeque<String>,
    finished_set: HashSet<String>,
}

impl ActiveTable {
    fn finish(&mut self, execution_id: &str) {
        if self.running.remove(execution_id).is_some() {
            if self.finished.len() == FINISHED_RING_CAPACITY {
                if let Some(evicted) = self.finished.pop_front() {
                    self.finished_set.remove(&evicted);
                }
            }
            self.finished.push_back(execution_id.to_string());
            self.finished_set.insert(execution_id.to_string());
        }
    }
}

/// Public entry point for sandboxed execution.
pub struct SandboxService {
    registry: Arc<RunnerRegistry>,
    process: ProcessBackend,
    #[cfg(feature = "containers")]
    container: Option<ContainerBackend>,
    policy: SandboxPolicy,
    gate: Arc<Semaphore>,
    active: Mutex<ActiveTable>,
    metrics: SharedMetrics,
}

impl SandboxService {
    /// Initialize both backends according to the policy.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::ContainerUnavailable`] when
    /// `require_container` is set and no container runtime answers.
    pub async fn new(
        config: SandboxServiceConfig,
        metrics: SharedMetrics,
    ) -> Result<Self, SandboxError> {
        let registry = Arc::new(RunnerRegistry::new());
        let process = ProcessBackend::new(config.process, Arc::clone(&registry));

        #[cfg(feature = "containers")]
        let container = if config.policy.prefer_container || config.policy.require_container {
            match ContainerBackend::new(config.container, Arc::clone(&registry)).await {
                Ok(backend) => {
                    info!("container backend initialized");
                    Some(backend)
                }
                Err(e) if config.policy.require_container => return Err(e),
                Err(e) => {
                    warn!(error = %e, "container backend unavailable, running degraded (process backend only)");
                    None
                }
            }
        } else {
            None
        };

        #[cfg(not(feature = "containers"))]
        if config.policy.require_container {
            return Err(SandboxError::ContainerUnavailable(
                "built without the 'containers' feature".to_string(),
            ));
        }

        let max_concurrent = config.max_concurrent.max(1);
        Ok(Self {
            registry,
            process,
            #[cfg(feature = "containers")]
            container,
            policy: config.policy,
            gate: Arc::new(Semaphore::new(max_concurrent)),
            active: Mutex::new(ActiveTable::default()),
            metrics,
        })
    }

    /// Mint a server-side execution id.
    pub fn mint_execution_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Execute a submission, routing per policy and request pin. Never
    /// returns an error; failures surface inside the result.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let execution_id = Self::mint_execution_id();
        self.execute_as(&execution_id, request).await
    }

    /// Execute under a caller-chosen execution id (the id the caller may
    /// later pass to [`kill`](Self::kill)).
    pub async fn execute_as(
        &self,
        execution_id: &str,
        request: &ExecutionRequest,
    ) -> ExecutionResult {
        self.metrics.incr_counter(SANDBOX_EXEC_TOTAL, 1);

        let Ok(_permit) = Arc::clone(&self.gate).acquire_owned().await else {
            return ExecutionResult::internal_error("sandbox is shutting down");
        };

        let backend = match self.choose_backend(request.backend) {
            Ok(backend) => backend,
            Err(e) => return ExecutionResult::internal_error(e.to_string()),
        };

        self.active
            .lock()
            .running
            .insert(execution_id.to_string(), backend);
        self.publish_inflight();

        let outcome = match backend {
            BackendKind::Process => self.process.execute(execution_id, request).await,
            #[cfg(feature = "containers")]
            BackendKind::Container => {
                self.container
                    .as_ref()
                    .expect("container backend checked by choose_backend")
                    .execute(execution_id, request)
                    .await
            }
            #[cfg(not(feature = "containers"))]
            BackendKind::Container => Err(SandboxError::ContainerUnavailable(
                "built without the 'containers' feature".to_string(),
            )),
        };

        self.active.lock().finish(execution_id);
        self.publish_inflight();

        outcome.unwrap_or_else(|e| ExecutionResult::internal_error(e.to_string()))
    }

    /// Execute on the container backend only.
    pub async fn execute_secure(&self, request: &ExecutionRequest) -> ExecutionResult {
        if !self.container_available() {
            return ExecutionResult::internal_error("container backend not available");
        }
        let mut request = request.clone();
        request.backend = Some(BackendKind::Container);
        self.execute(&request).await
    }

    /// Run an existing file. Verbatim argv always uses the process backend;
    /// extension-inferred runs route like [`execute`](Self::execute).
    pub async fn execute_file(&self, request: &FileExecutionRequest) -> ExecutionResult {
        self.metrics.incr_counter(SANDBOX_EXEC_TOTAL, 1);

        let Ok(_permit) = Arc::clone(&self.gate).acquire_owned().await else {
            return ExecutionResult::internal_error("sandbox is shutting down");
        };

        let backend = if request.argv.is_empty() {
            match self.choose_backend(None) {
                Ok(backend) => backend,
                Err(e) => return ExecutionResult::internal_error(e.to_string()),
            }
        } else {
            BackendKind::Process
        };

        let execution_id = Self::mint_execution_id();
        self.active
            .lock()
            .running
            .insert(execution_id.clone(), backend);
        self.publish_inflight();

        let outcome = match backend {
            BackendKind::Process => self.process.execute_file(&execution_id, request).await,
            #[cfg(feature = "containers")]
            BackendKind::Container => {
                self.container
                    .as_ref()
                    .expect("container backend checked by choose_backend")
                    .execute_file(&execution_id, request)
                    .await
            }
            #[cfg(not(feature = "containers"))]
            BackendKind::Container => Err(SandboxError::ContainerUnavailable(
                "built without the 'containers' feature".to_string(),
            )),
        };

        self.active.lock().finish(&execution_id);
        self.publish_inflight();

        outcome.unwrap_or_else(|e| ExecutionResult::internal_error(e.to_string()))
    }

    /// Cancel a running execution. Killing an already-finished execution is
    /// a no-op that returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::ExecutionNotFound`] for ids this service
    /// never ran.
    pub fn kill(&self, execution_id: &str) -> Result<(), SandboxError> {
        let table = self.active.lock();
        if let Some(backend) = table.running.get(execution_id) {
            match backend {
                BackendKind::Process => self.process.kill(execution_id),
                #[cfg(feature = "containers")]
                BackendKind::Container => self
                    .container
                    .as_ref()
                    .is_some_and(|c| c.kill(execution_id)),
                #[cfg(not(feature = "containers"))]
                BackendKind::Container => false,
            };
            return Ok(());
        }
        if table.finished_set.contains(execution_id) {
            return Ok(());
        }
        Err(SandboxError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Executions currently running across both backends.
    pub fn in_flight(&self) -> u64 {
        #[cfg(feature = "containers")]
        let container = self.container.as_ref().map_or(0, ContainerBackend::in_flight);
        #[cfg(not(feature = "containers"))]
        let container = 0;
        self.process.in_flight() + container
    }

    /// Counters summed across backends.
    pub fn stats(&self) -> StatsSnapshot {
        let stats = self.process.stats();
        #[cfg(feature = "containers")]
        let stats = match &self.container {
            Some(container) => stats.merge(container.stats()),
            None => stats,
        };
        stats
    }

    /// Capability report: backend availability, hardening, languages.
    pub fn facts(&self) -> SandboxFacts {
        let container_available = self.container_available();
        #[cfg(feature = "containers")]
        let seccomp = self
            .container
            .as_ref()
            .is_some_and(|c| c.security_facts().seccomp);
        #[cfg(not(feature = "containers"))]
        let seccomp = false;

        SandboxFacts {
            container_available,
            seccomp_enabled: seccomp,
            readonly_rootfs: container_available,
            languages: self
                .registry
                .languages()
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    pub fn languages(&self) -> Vec<&'static str> {
        self.registry.languages()
    }

    /// Stop accepting work and tear down both backends.
    pub async fn shutdown(&self) {
        self.gate.close();
        self.process.shutdown().await;
        #[cfg(feature = "containers")]
        if let Some(container) = &self.container {
            container.shutdown().await;
        }
    }

    fn container_available(&self) -> bool {
        #[cfg(feature = "containers")]
        {
            self.container.is_some()
        }
        #[cfg(not(feature = "containers"))]
        {
            false
        }
    }

    fn choose_backend(&self, requested: Option<BackendKind>) -> Result<BackendKind, SandboxError> {
        match requested {
            Some(BackendKind::Process) => Ok(BackendKind::Process),
            Some(BackendKind::Container) => {
                if self.container_available() {
                    Ok(BackendKind::Container)
                } else {
                    Err(SandboxError::ContainerUnavailable(
                        "container backend not available".to_string(),
                    ))
                }
            }
            None => {
                if self.container_available() && self.policy.prefer_container {
                    Ok(BackendKind::Container)
                } else {
                    Ok(BackendKind::Process)
                }
            }
        }
    }

    fn publish_inflight(&self) {
        self.metrics
            .set_gauge(SANDBOX_EXEC_INFLIGHT, self.in_flight() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;

    fn process_only_config() -> SandboxServiceConfig {
        SandboxServiceConfig {
            policy: SandboxPolicy {
                prefer_container: false,
                require_container: false,
            },
            max_concurrent: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_degraded_start_without_containers() {
        let service = SandboxService::new(process_only_config(), metrics::noop())
            .await
            .unwrap();

        let facts = service.facts();
        assert!(!facts.container_available);
        assert!(!facts.seccomp_enabled);
        assert_eq!(facts.languages.len(), 10);
    }

    #[tokio::test]
    async fn test_execute_secure_unavailable() {
        let service = SandboxService::new(process_only_config(), metrics::noop())
            .await
            .unwrap();

        let request = ExecutionRequest::new("python", "print(1)");
        let result = service.execute_secure(&request).await;
        assert_eq!(result.termination, Termination::InternalError);
        assert!(
            result
                .diagnostics
                .unwrap()
                .contains("container backend not available")
        );
    }

    #[tokio::test]
    async fn test_unknown_language_is_well_formed_result() {
        let service = SandboxService::new(process_only_config(), metrics::noop())
            .await
            .unwrap();

        let result = service
            .execute(&ExecutionRequest::new("brainfuck", "+"))
            .await;
        assert_eq!(result.termination, Termination::InternalError);
        assert!(result.diagnostics.unwrap().contains("not supported"));
    }

    #[tokio::test]
    async fn test_kill_unknown_id_is_not_found() {
        let service = SandboxService::new(process_only_config(), metrics::noop())
            .await
            .unwrap();

        assert!(matches!(
            service.kill("never-ran"),
            Err(SandboxError::ExecutionNotFound(_))
        ));
    }

    #[test]
    fn test_finished_ring_eviction() {
        let mut table = ActiveTable::default();
        for i in 0..(FINISHED_RING_CAPACITY + 10) {
            let id = format!("exec-{i}");
            table.running.insert(id.clone(), BackendKind::Process);
            table.finish(&id);
        }
        assert_eq!(table.finished.len(), FINISHED_RING_CAPACITY);
        assert!(!table.finished_set.contains("exec-0"));
        assert!(table.finished_set.contains("exec-100"));
    }
}
