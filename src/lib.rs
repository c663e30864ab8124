//! # Apex Execution Core
//!
//! Server-side execution substrate of the Apex cloud development platform:
//! many concurrent users edit, execute and deploy code projects in
//! isolated, multi-language environments. This crate owns the hardest
//! pieces — sandboxed execution and the subsystems coupled to it — while
//! HTTP routing, AI clients, billing and the metadata ORM live above it.
//!
//! ## Architecture Overview
//!
//! - **[`sandbox`]**: Sandboxed code execution in ten languages with
//!   resource limits, timeouts and automatic fallback between a container
//!   backend and an in-process backend.
//! - **[`db`]**: Managed per-project data plane — relational, key-value
//!   and embedded-file databases with credential minting, safe identifier
//!   handling and connection pooling.
//! - **[`presence`]**: Per-room in-memory collaboration state — cursors,
//!   selections, permissions, activity feeds.
//! - **[`secrets`]**: Per-user derived-key authenticated encryption for
//!   credential blobs.
//! - **[`alwayson`]**: Reconciliation loop keeping long-running
//!   deployments alive and health-checked.
//! - **[`cache`]**: Two-tier (remote KV + bounded in-memory) cache used by
//!   metadata reads.
//! - **[`metrics`] / [`audit`]**: Sink traits the components emit through.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use apex_core::config::AppConfig;
//! use apex_core::metrics;
//! use apex_core::sandbox::{ExecutionRequest, SandboxService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::discover()?;
//!     let sandbox = SandboxService::new(config.sandbox_config(), metrics::noop()).await?;
//!
//!     let result = sandbox
//!         .execute(&ExecutionRequest::new("python", "print(1+2)"))
//!         .await;
//!     println!("{}", result.stdout);
//!     Ok(())
//! }
//! ```

/// Sandboxed code execution engine.
///
/// Public façade, process and container backends, the language runner
/// registry and per-execution scratch directories.
pub mod sandbox;

/// Container runtime layer (requires the `containers` feature).
///
/// Bollard client wrapper with Docker/Podman fallback, hardened container
/// specifications and exec plumbing, consumed by the sandbox's container
/// backend.
#[cfg(feature = "containers")]
pub mod container;

/// Managed per-project data plane.
///
/// Provisioning, lifecycling, query execution and introspection for
/// relational, key-value and embedded-file databases.
pub mod db;

/// Real-time presence and collaboration state.
pub mod presence;

/// Secrets manager: per-user derived-key authenticated encryption.
pub mod secrets;

/// Always-on deployment controller.
pub mod alwayson;

/// Two-tier cache layer.
pub mod cache;

/// Metrics sink collaborators.
pub mod metrics;

/// Security audit sink.
pub mod audit;

/// Configuration discovery and loading.
pub mod config;

/// Environment constants and path utilities.
pub mod env;

/// Command-line interface.
pub mod cli;

// Re-export the main sandbox types
pub use sandbox::{
    BackendKind, ExecutionRequest, ExecutionResult, FileExecutionRequest, ResourceLimits,
    SandboxError, SandboxFacts, SandboxPolicy, SandboxService, SandboxServiceConfig, Termination,
};

// Re-export the main data-plane types
pub use db::{
    DbError, DbKind, DbQuotas, DbServiceConfig, DbState, ManagedDatabase, ManagedDbService,
    QueryResult,
};

// Re-export the main presence types
pub use presence::{Permission, PresenceEntry, PresenceManager, PresenceUpdate, UserStatus};

// Re-export the main secrets types
pub use secrets::{EncryptedSecret, SecretBlob, SecretsConfig, SecretsError, SecretsManager};

// Re-export the always-on controller
pub use alwayson::{AlwaysOnConfig, AlwaysOnController, DeploymentApi, InventoryProvider};

// Re-export the cache service
pub use cache::{CacheConfig, CacheService, CacheStats, RemoteKv};

// Re-export configuration
pub use config::AppConfig;
