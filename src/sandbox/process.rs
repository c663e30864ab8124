//! Process execution backend.
//!
//! Runs compile and run steps as child processes inside a per-execution
//! scratch directory. Timeouts and kills use soft-then-hard termination: a
//! SIGTERM first, then a SIGKILL after a grace period. Memory caps are set
//! with `RLIMIT_AS` before exec on Linux and are advisory elsewhere.

use super::recipe::{Recipe, RunnerRegistry};
use super::scratch::ScratchDir;
use super::types::{
    ExecutionRequest, ExecutionResult, ExecutionStats, FileExecutionRequest, ResourceLimits,
    SandboxError, StatsSnapshot, Termination,
};
use crate::env::sandbox::{OUTPUT_TRUNCATED_MARKER, STDIN_STREAM_THRESHOLD};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Process backend tunables.
#[derive(Debug, Clone)]
pub struct ProcessBackendConfig {
    /// Wall-clock cap when the request carries none
    pub default_timeout: Duration,
    /// Wall-clock cap for the compile step
    pub compile_timeout: Duration,
    /// Default peak-memory cap in bytes (0 disables)
    pub memory_limit_bytes: u64,
    /// Per-stream capture cap; overflow is truncated with a marker
    pub max_output_bytes: usize,
    /// Delay between the soft termination and the hard kill
    pub grace_period: Duration,
    /// Root for scratch directories (system temp dir when unset)
    pub scratch_root: Option<PathBuf>,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            compile_timeout: Duration::from_secs(60),
            memory_limit_bytes: 512 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            grace_period: Duration::from_secs(2),
            scratch_root: None,
        }
    }
}

/// Outcome of one child process, before assembly into an [`ExecutionResult`].
struct ChildOutcome {
    exit_code: i32,
    stdout: String,
    stderr: String,
    termination: Termination,
    peak_memory: u64,
}

/// Executes recipes as host child processes.
pub struct ProcessBackend {
    config: ProcessBackendConfig,
    registry: Arc<RunnerRegistry>,
    active: DashMap<String, CancellationToken>,
    stats: Arc<ExecutionStats>,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig, registry: Arc<RunnerRegistry>) -> Self {
        Self {
            config,
            registry,
            active: DashMap::new(),
            stats: Arc::new(ExecutionStats::default()),
        }
    }

    /// Compile (when required) and run a submission.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` for unknown languages or missing toolchains and
    /// I/O errors from scratch preparation. Runtime failures after the
    /// process starts are reported inside the result, not as errors.
    pub async fn execute(
        &self,
        execution_id: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        let recipe = self.registry.resolve(&request.language)?;
        recipe.ensure_host_runtime()?;
        let compiler = recipe.resolve_host_compiler()?;

        let scratch = self.create_scratch()?;
        let prepared = recipe.prepare_source(&request.source);
        let source_name = recipe.source_name(&prepared);
        scratch.write_file(&source_name, prepared.as_bytes()).await?;

        self.run_tracked(execution_id, |token| {
            self.run_pipeline(recipe, compiler, scratch, source_name, request, token)
        })
        .await
    }

    /// Run an existing file. An empty `argv` infers the language from the
    /// file extension; a non-empty `argv` runs verbatim in the file's
    /// directory.
    pub async fn execute_file(
        &self,
        execution_id: &str,
        request: &FileExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        if !request.argv.is_empty() {
            let dir = request
                .path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let argv = request.argv.clone();
            let stdin = request.stdin.clone();
            let timeout = request.timeout.unwrap_or(self.config.default_timeout);
            let limits = request.limits;

            return self
                .run_tracked(execution_id, |token| async move {
                    let started = Instant::now();
                    let outcome = self
                        .run_child(&argv, &dir, &stdin, timeout, limits, &token)
                        .await?;
                    Ok(assemble(outcome, started))
                })
                .await;
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

    /// Cancel every active execution and wait for the maps to drain.
    pub async fn shutdown(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
        // Children receive the cancellation; give them one grace period.
        let deadline = Instant::now() + self.config.grace_period + Duration::from_secs(1);
        while !self.active.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn create_scratch(&self) -> Result<ScratchDir, SandboxError> {
        let scratch = match &self.config.scratch_root {
            Some(root) => ScratchDir::create_in(root)?,
            None => ScratchDir::create()?,
        };
        Ok(scratch)
    }

    /// Register the execution in the active table, run it, and unregister on
    /// every exit path.
    async fn run_tracked<F, Fut>(
        &self,
        execution_id: &str,
        run: F,
    ) -> Result<ExecutionResult, SandboxError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<ExecutionResult, SandboxError>>,
    {
        let token = CancellationToken::new();
        self.active.insert(execution_id.to_string(), token.clone());
        self.stats.record_start();

        let outcome = run(token).await;
        self.active.remove(execution_id);

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(execution_id, error = %err, "process backend failure");
                ExecutionResult::internal_error(err.to_string())
            }
        };
        self.stats.record_finish(result.termination);
        Ok(result)
    }

    async fn run_pipeline(
        &self,
        recipe: &'static Recipe,
        compiler: Option<String>,
        scratch: ScratchDir,
        source_name: String,
        request: &ExecutionRequest,
        token: CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let started = Instant::now();
        let artifact = recipe.artifact_name(&source_name);

        if let (Some(tool), Some(artifact_name)) = (compiler.as_deref(), artifact.as_deref()) {
            let argv = recipe
                .compile_argv(tool, &source_name, artifact_name)
                .expect("compiled recipe has compile argv");
            debug!(language = recipe.language, ?argv, "compiling");

            let compile = self
                .run_child(
                    &argv,
                    scratch.path(),
                    &[],
                    self.config.compile_timeout,
                    None,
                    &token,
                )
                .await?;

            if compile.termination != Termination::Completed {
                return Ok(assemble(compile, started));
            }
            if compile.exit_code != 0 {
                let diag = join_streams(&compile.stdout, &compile.stderr);
                return Ok(ExecutionResult {
                    exit_code: compile.exit_code,
                    stdout: String::new(),
                    stderr: diag.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    memory_bytes: 0,
                    termination: Termination::CompileError,
                    diagnostics: Some(diag),
                });
            }
        }

        let mut argv = recipe.run_argv(&source_name, artifact.as_deref());
        argv.extend(request.argv.iter().cloned());
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        debug!(language = recipe.language, ?argv, ?timeout, "running");

        let outcome = self
            .run_child(
                &argv,
                scratch.path(),
                &request.stdin,
                timeout,
                request.limits,
                &token,
            )
            .await?;
        // `scratch` drops here, removing the directory on every path.
        Ok(assemble(outcome, started))
    }

    async fn run_child(
        &self,
        argv: &[String],
        dir: &Path,
        stdin_bytes: &[u8],
        timeout: Duration,
        limits: Option<ResourceLimits>,
        token: &CancellationToken,
    ) -> Result<ChildOutcome, SandboxError> {
        let memory_cap = limits
            .map(|l| l.memory_bytes)
            .filter(|&m| m > 0)
            .unwrap_or(self.config.memory_limit_bytes);

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(dir)
            .stdin(if stdin_bytes.is_empty() {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HOME", dir)
            .env("LANG", "C.UTF-8");

        apply_memory_limit(&mut command, memory_cap);

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Backend(format!("failed to spawn '{}': {e}", argv[0])))?;
        let pid = child.id();

        if let Some(mut sink) = child.stdin.take() {
            if stdin_bytes.len() < STDIN_STREAM_THRESHOLD {
                // Small payloads are written in full before capture begins.
                sink.write_all(stdin_bytes).await.ok();
                drop(sink);
            } else {
                // Large payloads stream while output drains, so neither pipe
                // can fill and deadlock.
                let payload = stdin_bytes.to_vec();
                tokio::spawn(async move {
                    let _ = sink.write_all(&payload).await;
                    let _ = sink.shutdown().await;
                });
            }
        }

        let cap = self.config.max_output_bytes;
        let stdout_task = tokio::spawn(read_capped(
            child.stdout.take().expect("stdout piped"),
            cap,
        ));
        let stderr_task = tokio::spawn(read_capped(
            child.stderr.take().expect("stderr piped"),
            cap,
        ));

        let peak = Arc::new(AtomicU64::new(0));
        let sampler_stop = CancellationToken::new();
        if let Some(pid) = pid {
            spawn_memory_sampler(pid, Arc::clone(&peak), sampler_stop.clone());
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        // Disarmed until a soft termination is sent.
        let grace = tokio::time::sleep(Duration::from_secs(86400 * 365));
        tokio::pin!(grace);

        let mut termination = Termination::Completed;
        let mut stopping = false;
        let mut send_soft = false;
        let mut send_hard = false;

        // Child mutations happen at the top of the loop, outside the select,
        // so no branch handler borrows the child while `wait` is polled.
        let status = loop {
            if send_soft {
                send_soft = false;
                soft_terminate(pid, &mut child);
            }
            if send_hard {
                send_hard = false;
                let _ = child.start_kill();
            }
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| SandboxError::Backend(format!("wait failed: {e}")))?;
                }
                _ = &mut deadline, if !stopping => {
                    stopping = true;
                    termination = Termination::Timeout;
                    send_soft = true;
                    grace.as_mut().reset(tokio::time::Instant::now() + self.config.grace_period);
                }
                _ = token.cancelled(), if !stopping => {
                    stopping = true;
                    termination = Termination::Killed;
                    send_soft = true;
                    grace.as_mut().reset(tokio::time::Instant::now() + self.config.grace_period);
                }
                _ = &mut grace, if stopping => {
                    send_hard = true;
                    grace.as_mut().reset(tokio::time::Instant::now() + Duration::from_secs(3600));
                }
            }
        };
        sampler_stop.cancel();

        let (stdout_raw, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr_raw, stderr_truncated) = stderr_task.await.unwrap_or_default();

        let exit_code = exit_code_of(&status);
        if termination == Termination::Completed && was_memory_killed(&status, memory_cap) {
            termination = Termination::Oom;
        }

        Ok(ChildOutcome {
            exit_code,
            stdout: finish_stream(stdout_raw, stdout_truncated),
            stderr: finish_stream(stderr_raw, stderr_truncated),
            termination,
            peak_memory: peak.load(Ordering::Relaxed),
        })
    }
}

fn assemble(outcome: ChildOutcome, started: Instant) -> ExecutionResult {
    ExecutionResult {
        exit_code: outcome.exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        duration_ms: started.elapsed().as_millis() as u64,
        memory_bytes: outcome.peak_memory,
        termination: outcome.termination,
        diagnostics: None,
    }
}

fn finish_stream(raw: Vec<u8>, truncated: bool) -> String {
    let mut text = String::from_utf8_lossy(&raw).into_owned();
    if truncated {
        text.push_str(OUTPUT_TRUNCATED_MARKER);
    }
    text
}

fn join_streams(stdout: &str, stderr: &str) -> String {
    if stdout.is_empty() {
        stderr.to_string()
    } else if stderr.is_empty() {
        stdout.to_string()
    } else {
        format!("{stdout}\n{stderr}")
    }
}

/// Read a stream to EOF, keeping at most `cap` bytes. The stream is drained
/// past the cap so the child never blocks on a full pipe.
async fn read_capped<R>(mut reader: R, cap: usize) -> (Vec<u8>, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; 8192];
    let mut out = Vec::new();
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < cap {
                    let take = n.min(cap - out.len());
                    out.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (out, truncated)
}

#[cfg(target_os = "linux")]
fn apply_memory_limit(command: &mut Command, memory_bytes: u64) {
    if memory_bytes == 0 {
        return;
    }
    unsafe {
        command.pre_exec(move || {
            let limit = libc::rlimit {
                rlim_cur: memory_bytes,
                rlim_max: memory_bytes,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_memory_limit(_command: &mut Command, _memory_bytes: u64) {
    // Advisory only: no per-process address-space cap on this platform.
}

#[cfg(unix)]
fn soft_terminate(pid: Option<u32>, _child: &mut Child) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn soft_terminate(_pid: Option<u32>, child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// A SIGKILL with a memory cap in place is attributed to the kernel OOM
/// killer; `RLIMIT_AS` failures usually surface as allocator aborts instead,
/// so this stays best-effort.
#[cfg(unix)]
fn was_memory_killed(status: &std::process::ExitStatus, memory_cap: u64) -> bool {
    use std::os::unix::process::ExitStatusExt;
    memory_cap > 0 && status.signal() == Some(libc::SIGKILL)
}

#[cfg(not(unix))]
fn was_memory_killed(_status: &std::process::ExitStatus, _memory_cap: u64) -> bool {
    false
}

/// Sample the child's peak RSS from /proc while it runs. VmHWM is already a
/// high-water mark, so sparse sampling loses little.
#[cfg(target_os = "linux")]
fn spawn_memory_sampler(pid: u32, peak: Arc<AtomicU64>, stop: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(rss) = read_peak_rss(pid) {
                        peak.fetch_max(rss, Ordering::Relaxed);
                    }
                }
            }
        }
    });
}

#[cfg(not(target_os = "linux"))]
fn spawn_memory_sampler(_pid: u32, _peak: Arc<AtomicU64>, _stop: CancellationToken) {}

#[cfg(target_os = "linux")]
fn read_peak_rss(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}
