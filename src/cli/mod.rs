//! Command-line interface.
//!
//! A thin operational surface over the execution core: run a file through
//! the sandbox, list languages, probe capabilities, dump the effective
//! configuration. The HTTP layer lives outside this crate; this binary is
//! what operators and CI use directly.

use anyhow::Context;
use std::time::Duration;
use tracing::info;

/// Command-line argument definitions.
pub mod args;

pub use args::{Args, BackendArg, Command};

use crate::config::AppConfig;
use crate::metrics;
use crate::sandbox::{
    ExecutionRequest, FileExecutionRequest, SandboxService, Termination,
};

/// Load configuration honoring an explicit `--config` path.
pub fn load_config(args: &Args) -> anyhow::Result<AppConfig> {
    match &args.config {
        Some(path) => AppConfig::from_toml_file(path).context("loading configuration"),
        None => AppConfig::discover().context("discovering configuration"),
    }
}

/// Run one file through the sandbox and print the JSON result. The process
/// exit code mirrors the execution's.
pub async fn run_exec(
    config: &AppConfig,
    file: std::path::PathBuf,
    lang: Option<String>,
    stdin_file: Option<std::path::PathBuf>,
    timeout_ms: Option<u64>,
    backend: Option<BackendArg>,
) -> anyhow::Result<i32> {
    let sandbox = SandboxService::new(config.sandbox_config(), metrics::noop())
        .await
        .context("initializing sandbox")?;

    let stdin = match stdin_file {
        Some(path) => tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading stdin file {}", path.display()))?,
        None => Vec::new(),
    };

    let result = match lang {
        Some(lang) => {
            let source = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let mut request = ExecutionRequest::new(lang, source).with_stdin(stdin);
            if let Some(ms) = timeout_ms {
                request = request.with_timeout(Duration::from_millis(ms));
            }
            request.backend = backend.map(Into::into);
            sandbox.execute(&request).await
        }
        None => {
            let mut request = FileExecutionRequest::new(file);
            request.stdin = stdin;
            request.timeout = timeout_ms.map(Duration::from_millis);
            sandbox.execute_file(&request).await
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    sandbox.shutdown().await;

    Ok(match result.termination {
        Termination::Completed => result.exit_code,
        _ => 1,
    })
}

/// Print the supported language list.
pub fn run_languages() {
    let registry = crate::sandbox::RunnerRegistry::new();
    for language in registry.languages() {
        println!("{language}");
    }
}

/// Probe backends and print the facts report plus counters.
pub async fn run_doctor(config: &AppConfig) -> anyhow::Result<()> {
    let sandbox = SandboxService::new(config.sandbox_config(), metrics::noop())
        .await
        .context("initializing sandbox")?;

    let facts = sandbox.facts();
    let stats = sandbox.stats();
    info!(
        container_available = facts.container_available,
        seccomp = facts.seccomp_enabled,
        "sandbox probed"
    );

    let report = serde_json::json!({
        "facts": facts,
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    sandbox.shutdown().await;
    Ok(())
}

/// Print the effective configuration as TOML.
pub fn run_config(config: &AppConfig) -> anyhow::Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
