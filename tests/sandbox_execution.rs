//! Sandbox end-to-end behavior through the public façade.
//!
//! Tests needing language toolchains or a container runtime are `#[ignore]`
//! so the default suite runs on a bare host; the shell-script paths cover
//! the execution machinery itself on any unix box.

use apex_core::metrics::{self, InMemoryMetrics, MetricsSink, SANDBOX_EXEC_TOTAL};
use apex_core::sandbox::{
    BackendKind, ExecutionRequest, FileExecutionRequest, SandboxPolicy, SandboxService,
    SandboxServiceConfig, Termination,
};
use std::sync::Arc;
use std::time::Duration;

fn process_only() -> SandboxServiceConfig {
    SandboxServiceConfig {
        policy: SandboxPolicy {
            prefer_container: false,
            require_container: false,
        },
        max_concurrent: 4,
        ..Default::default()
    }
}

async fn service() -> SandboxService {
    SandboxService::new(process_only(), metrics::noop())
        .await
        .unwrap()
}

#[cfg(unix)]
async fn script_request(dir: &std::path::Path, body: &str) -> FileExecutionRequest {
    let script = dir.join(format!("script-{}.sh", uuid::Uuid::new_v4()));
    tokio::fs::write(&script, format!("#!/bin/sh\n{body}\n"))
        .await
        .unwrap();
    let mut request = FileExecutionRequest::new(&script);
    request.argv = vec!["sh".to_string(), script.display().to_string()];
    request
}

#[tokio::test]
#[cfg(unix)]
async fn stdout_and_exit_code_captured() {
    let sandbox = service().await;
    let dir = tempfile::tempdir().unwrap();

    let request = script_request(dir.path(), "echo out; echo err >&2; exit 3").await;
    let result = sandbox.execute_file(&request).await;

    assert_eq!(result.termination, Termination::Completed);
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
}

#[tokio::test]
#[cfg(unix)]
async fn stdin_is_piped() {
    let sandbox = service().await;
    let dir = tempfile::tempdir().unwrap();

    let mut request = script_request(dir.path(), "cat").await;
    request.stdin = b"piped payload".to_vec();
    let result = sandbox.execute_file(&request).await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "piped payload");
}

#[tokio::test]
#[cfg(unix)]
async fn timeout_bound_holds() {
    let sandbox = service().await;
    let dir = tempfile::tempdir().unwrap();

    let mut request = script_request(dir.path(), "sleep 30").await;
    request.timeout = Some(Duration::from_millis(300));
    let result = sandbox.execute_file(&request).await;

    assert_eq!(result.termination, Termination::Timeout);
    // duration_ms ≤ timeout + grace, with scheduling slack
    assert!(result.duration_ms <= 300 + 2_000 + 500, "{}", result.duration_ms);
}

#[tokio::test]
#[cfg(unix)]
async fn in_flight_accounting_balances() {
    let sandbox = Arc::new(service().await);
    let dir = tempfile::tempdir().unwrap();

    let mut tasks = Vec::new();
    for i in 0..6 {
        let request = script_request(dir.path(), &format!("echo {i}")).await;
        let sandbox = Arc::clone(&sandbox);
        tasks.push(tokio::spawn(async move {
            sandbox.execute_file(&request).await
        }));
    }
    for task in tasks {
        let result = task.await.unwrap();
        assert_eq!(result.termination, Termination::Completed);
    }

    let stats = sandbox.stats();
    assert_eq!(stats.started, 6);
    assert_eq!(
        stats.completed + stats.failed + stats.timed_out + stats.killed + stats.in_flight,
        stats.started
    );
    assert_eq!(stats.in_flight, 0);
    assert!(stats.high_water >= 1);
}

#[tokio::test]
#[cfg(unix)]
async fn output_cap_appends_truncation_marker() {
    let mut config = process_only();
    config.process.max_output_bytes = 32;
    let sandbox = SandboxService::new(config, metrics::noop()).await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let request = script_request(dir.path(), "i=0; while [ $i -lt 200 ]; do echo aaaaaaaaaa; i=$((i+1)); done").await;
    let result = sandbox.execute_file(&request).await;

    assert_eq!(result.termination, Termination::Completed);
    assert!(result.stdout.ends_with("...[output truncated]"));
    // 32 bytes kept plus the marker; the rest was drained and dropped.
    assert!(result.stdout.len() < 100);
}

#[tokio::test]
#[cfg(unix)]
async fn gate_serializes_when_saturated() {
    let mut config = process_only();
    config.max_concurrent = 1;
    let sandbox = Arc::new(SandboxService::new(config, metrics::noop()).await.unwrap());
    let dir = tempfile::tempdir().unwrap();

    let started = std::time::Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let request = script_request(dir.path(), "sleep 0.2").await;
        let sandbox = Arc::clone(&sandbox);
        tasks.push(tokio::spawn(async move {
            sandbox.execute_file(&request).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().termination, Termination::Completed);
    }

    // Three 200ms executions through a width-1 gate cannot overlap: callers
    // observe latency, not failure.
    assert!(started.elapsed() >= Duration::from_millis(550));
}

#[tokio::test]
async fn exec_total_metric_emitted() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let sandbox = SandboxService::new(process_only(), Arc::clone(&metrics) as Arc<dyn MetricsSink>)
        .await
        .unwrap();

    sandbox
        .execute(&ExecutionRequest::new("nosuchlang", "x"))
        .await;
    assert_eq!(metrics.counter(SANDBOX_EXEC_TOTAL), 1);
}

#[tokio::test]
async fn pinned_container_backend_unavailable() {
    let sandbox = service().await;
    let request = ExecutionRequest::new("python", "print(1)").on_backend(BackendKind::Container);
    let result = sandbox.execute(&request).await;
    assert_eq!(result.termination, Termination::InternalError);
}

#[tokio::test]
#[ignore] // Requires a python3 interpreter on the host
async fn python_happy_path() {
    let sandbox = service().await;
    let request = ExecutionRequest::new("python", "print(1+2)")
        .with_timeout(Duration::from_millis(5_000));
    let result = sandbox.execute(&request).await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "3\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.termination, Termination::Completed);
    assert!(result.duration_ms <= 5_000);
}

#[tokio::test]
#[ignore] // Requires a python3 interpreter on the host
async fn python_busy_loop_times_out() {
    let sandbox = service().await;
    let request = ExecutionRequest::new("python", "while True: pass")
        .with_timeout(Duration::from_millis(300));
    let result = sandbox.execute(&request).await;

    assert_eq!(result.termination, Termination::Timeout);
    assert!((300..=2_500).contains(&result.duration_ms), "{}", result.duration_ms);
}

#[tokio::test]
#[ignore] // Requires a go toolchain on the host
async fn go_compile_error_surfaces_diagnostics() {
    let sandbox = service().await;
    let request = ExecutionRequest::new("go", "package main\nfunc main(){x:=}")
        .with_timeout(Duration::from_millis(5_000));
    let result = sandbox.execute(&request).await;

    assert_eq!(result.termination, Termination::CompileError);
    assert_ne!(result.exit_code, 0);
    assert_eq!(result.stdout, "");
    assert!(!result.stderr.is_empty());
}

#[tokio::test]
#[ignore] // Requires a python3 interpreter on the host
async fn scratch_directories_are_isolated() {
    let sandbox = service().await;

    // A writes a file into its scratch directory and prints the directory.
    let a = sandbox
        .execute(&ExecutionRequest::new(
            "python",
            "import os\nopen('witness.txt','w').write('A')\nprint(os.getcwd())",
        ))
        .await;
    assert_eq!(a.termination, Termination::Completed);
    let a_dir = a.stdout.trim().to_string();

    // B cannot see A's file, and runs somewhere else entirely.
    let b = sandbox
        .execute(&ExecutionRequest::new(
            "python",
            "import os\nprint(os.path.exists('witness.txt'))\nprint(os.getcwd())",
        ))
        .await;
    assert_eq!(b.termination, Termination::Completed);
    let mut lines = b.stdout.lines();
    assert_eq!(lines.next(), Some("False"));
    assert_ne!(lines.next(), Some(a_dir.as_str()));

    // Neither scratch directory survives its execution.
    assert!(!std::path::Path::new(&a_dir).exists());
}
