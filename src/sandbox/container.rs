//! Container execution backend.
//!
//! Satisfies the same contract as the process backend, but compiles and runs
//! the submission inside a single-use hardened container. The scratch
//! directory is bind-mounted read-write at `/workspace`; the image comes
//! from the language recipe. Timeouts and kills tear the container down
//! rather than signalling the process tree.

use super::recipe::RunnerRegistry;
use super::scratch::ScratchDir;
use super::types::{
    ExecutionRequest, ExecutionResult, ExecutionStats, FileExecutionRequest, SandboxError,
    StatsSnapshot, Termination,
};
use crate::container::{
    ContainerError, RuntimeClient, SandboxContainerSpec, SecurityFacts, exec_in_container,
};
use crate::env::CONTAINER_NAME_PREFIX;
use crate::env::sandbox::{CONTAINER_WORKSPACE, OUTPUT_TRUNCATED_MARKER};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Container backend tunables.
#[derive(Debug, Clone)]
pub struct ContainerBackendConfig {
    /// Wall-clock cap when the request carries none
    pub default_timeout: Duration,
    /// Extra wall-clock allowance for the compile step
    pub compile_timeout: Duration,
    /// Default memory cap per container
    pub memory_limit_bytes: u64,
    /// Default CPU quota per container (µs per 100 ms period)
    pub cpu_quota: i64,
    /// Per-stream capture cap
    pub max_output_bytes: usize,
    /// Pull missing images instead of failing
    pub auto_pull: bool,
    /// Seccomp profile path applied when the runtime supports it
    pub seccomp_profile: Option<String>,
    /// Root for scratch directories (system temp dir when unset)
    pub scratch_root: Option<PathBuf>,
}

impl Default for ContainerBackendConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            compile_timeout: Duration::from_secs(120),
            memory_limit_bytes: 512 * 1024 * 1024,
            cpu_quota: 100_000,
            max_output_bytes: 1024 * 1024,
            auto_pull: true,
            seccomp_profile: None,
            scratch_root: None,
        }
    }
}

/// Executes recipes inside single-use containers.
pub struct ContainerBackend {
    client: RuntimeClient,
    registry: Arc<RunnerRegistry>,
    config: ContainerBackendConfig,
    active: DashMap<String, CancellationToken>,
    stats: Arc<ExecutionStats>,
    facts: SecurityFacts,
}

impl ContainerBackend {
    /// Connect to the container runtime and probe its security posture.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::ContainerUnavailable`] when no runtime
    /// answers.
    pub async fn new(
        config: ContainerBackendConfig,
        registry: Arc<RunnerRegistry>,
    ) -> Result<Self, SandboxError> {
        let client = RuntimeClient::connect()
            .await
            .map_err(|e| SandboxError::ContainerUnavailable(e.to_string()))?;
        let facts = client.security_facts().await;

        Ok(Self {
            client,
            registry,
            config,
            active: DashMap::new(),
            stats: Arc::new(ExecutionStats::default()),
            facts,
        })
    }

    pub fn security_facts(&self) -> SecurityFacts {
        self.facts
    }

    /// Compile (when required) and run a submission in a fresh container.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` for unknown languages or absent images, and
    /// scratch I/O errors. Failures after the container starts are reported
    /// inside the result.
    pub async fn execute(
        &self,
        execution_id: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        let recipe = self.registry.resolve(&request.language)?;

        if self.config.auto_pull {
            self.client
                .ensure_image(recipe.image)
                .await
                .map_err(|e| SandboxError::NotSupported(e.to_string()))?;
        } else if !self.client.image_exists(recipe.image).await {
            return Err(SandboxError::NotSupported(format!(
                "image '{}' for language '{}' is not present",
                recipe.image, recipe.language
            )));
        }

        let scratch = match &self.config.scratch_root {
            Some(root) => ScratchDir::create_in(root)?,
            None => ScratchDir::create()?,
        };
        let prepared = recipe.prepare_source(&request.source);
        let source_name = recipe.source_name(&prepared);
        scratch.write_file(&source_name, prepared.as_bytes()).await?;

        let token = CancellationToken::new();
        self.active
            .insert(execution_id.to_string(), token.clone());
        self.stats.record_start();

        let outcome = self
            .run_in_container(recipe, &scratch, &source_name, request, &token)
            .await;
        self.active.remove(execution_id);

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(execution_id, error = %err, "container backend failure");
                ExecutionResult::internal_error(err.to_string())
            }
        };
        self.stats.record_finish(result.termination);
        Ok(result)
    }

    /// Run an existing file by inferring its language from the extension.
    /// Verbatim-argv execution is a process-backend capability.
    pub async fn execute_file(
        &self,
        execution_id: &str,
        request: &FileExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        if !request.argv.is_empty() {
            return Err(SandboxError::NotSupported(
                "verbatim argv execution requires the process backend".to_string(),
            ));
        }

        let extension = request
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let recipe = self.registry.resolve_extension(extension).ok_or_else(|| {
            SandboxError::NotSupported(format!(
                "cannot infer language from '{}'",
                request.path.display()
            ))
        })?;

        let source = tokio::fs::read_to_string(&request.path).await?;
        let exec_request = ExecutionRequest {
            language: recipe.language.to_string(),
            source,
            stdin: request.stdin.clone(),
            argv: Vec::new(),
            timeout: request.timeout,
            limits: request.limits,
            backend: None,
        };
        self.execute(execution_id, &exec_request).await
    }

    /// Cancel a running execution. Returns `false` when the id is not
    /// currently active.
    pub fn kill(&self, execution_id: &str) -> bool {
        match self.active.get(execution_id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.stats.in_flight.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Cancel every active execution and wait briefly for teardown.
    pub async fn shutdown(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.active.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn run_in_container(
        &self,
        recipe: &'static super::recipe::Recipe,
        scratch: &ScratchDir,
        source_name: &str,
        request: &ExecutionRequest,
        token: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let started = Instant::now();
        let memory = request
            .limits
            .map(|l| l.memory_bytes)
            .filter(|&m| m > 0)
            .unwrap_or(self.config.memory_limit_bytes);
        let cpu = request
            .limits
            .map(|l| l.cpu_quota)
            .filter(|&q| q > 0)
            .unwrap_or(self.config.cpu_quota);

        let spec = SandboxContainerSpec::new(recipe.image, scratch.path())
            .with_memory(memory)
            .with_cpu_quota(cpu)
            .with_seccomp(if self.facts.seccomp {
                self.config.seccomp_profile.clone()
            } else {
                None
            });

        let name = format!("{}-{}", CONTAINER_NAME_PREFIX, uuid::Uuid::new_v4());
        let docker = self.client.docker();
        let container_id = docker
            .create_container(
                Some(bollard::container::CreateContainerOptions {
                    name: name.as_str(),
                    ..Default::default()
                }),
                spec.to_container_config(),
            )
            .await
            .map_err(ContainerError::from)?
            .id;

        let result = async {
            docker
                .start_container(
                    &container_id,
                    None::<bollard::container::StartContainerOptions<String>>,
                )
                .await
                .map_err(ContainerError::from)?;

            let timeout = request.timeout.unwrap_or(self.config.default_timeout);
            let deadline = if recipe.compile.is_some() {
                timeout + self.config.compile_timeout
            } else {
                timeout
            };

            let work = self.compile_and_run(&container_id, recipe, source_name, request, memory);
            tokio::select! {
                result = work => result,
                _ = tokio::time::sleep(deadline) => Ok(finished(
                    started, 124, String::new(), String::new(), Termination::Timeout,
                )),
                _ = token.cancelled() => Ok(finished(
                    started, 137, String::new(), String::new(), Termination::Killed,
                )),
            }
        }
        .await;

        self.remove_container(&container_id).await;

        result.map(|mut r| {
            r.duration_ms = started.elapsed().as_millis() as u64;
            r
        })
    }

    async fn compile_and_run(
        &self,
        container_id: &str,
        recipe: &'static super::recipe::Recipe,
        source_name: &str,
        request: &ExecutionRequest,
        memory_cap: u64,
    ) -> Result<ExecutionResult, SandboxError> {
        let docker = self.client.docker();
        let started = Instant::now();
        let artifact = recipe.artifact_name(source_name);

        if let Some(tool) = recipe.default_compiler() {
            let artifact_name = artifact.as_deref().expect("compiled recipe has artifact");
            let argv = recipe
                .compile_argv(tool, source_name, artifact_name)
                .expect("compiled recipe has compile argv");
            debug!(language = recipe.language, ?argv, "compiling in container");

            let compile = exec_in_container(
                docker,
                container_id,
                &argv,
                &[],
                CONTAINER_WORKSPACE,
                self.config.max_output_bytes,
            )
            .await?;

            let exit_code = compile.exit_code.unwrap_or(-1) as i32;
            if exit_code != 0 {
                let diag = merge_outcome_streams(&compile);
                return Ok(ExecutionResult {
                    exit_code,
                    stdout: String::new(),
                    stderr: diag.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    memory_bytes: 0,
                    termination: Termination::CompileError,
                    diagnostics: Some(diag),
                });
            }
        }

        let mut argv = recipe.run_argv(source_name, artifact.as_deref());
        argv.extend(request.argv.iter().cloned());
        debug!(language = recipe.language, ?argv, "running in container");

        let run = exec_in_container(
            docker,
            container_id,
            &argv,
            &request.stdin,
            CONTAINER_WORKSPACE,
            self.config.max_output_bytes,
        )
        .await?;

        let exit_code = run.exit_code.unwrap_or(-1) as i32;
        // Memory-cap kills inside containers surface as SIGKILL (137).
        let termination = if memory_cap > 0 && exit_code == 137 {
            Termination::Oom
        } else {
            Termination::Completed
        };

        Ok(finished(
            started,
            exit_code,
            stream_to_string(run.stdout, run.stdout_truncated),
            stream_to_string(run.stderr, run.stderr_truncated),
            termination,
        ))
    }

    async fn remove_container(&self, container_id: &str) {
        let docker = self.client.docker();
        if let Err(e) = docker
            .remove_container(
                container_id,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container = container_id, error = %e, "container removal failed");
        }
    }
}

fn finished(
    started: Instant,
    exit_code: i32,
    stdout: String,
    stderr: String,
    termination: Termination,
) -> ExecutionResult {
    ExecutionResult {
        exit_code,
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as u64,
        memory_bytes: 0,
        termination,
        diagnostics: None,
    }
}

fn stream_to_string(raw: Vec<u8>, truncated: bool) -> String {
    let mut text = String::from_utf8_lossy(&raw).into_owned();
    if truncated {
        text.push_str(OUTPUT_TRUNCATED_MARKER);
    }
    text
}

fn merge_outcome_streams(outcome: &crate::container::ExecOutcome) -> String {
    let stdout = String::from_utf8_lossy(&outcome.stdout);
    let stderr = String::from_utf8_lossy(&outcome.stderr);
    if stdout.is_empty() {
        stderr.into_owned()
    } else if stderr.is_empty() {
        stdout.into_owned()
    } else {
        format!("{stdout}\n{stderr}")
    }
}
