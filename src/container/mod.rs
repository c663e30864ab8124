//! Container runtime layer for the sandbox.
//!
//! Wraps the bollard Docker API behind a small surface: a runtime client
//! with Docker/Podman connection fallback, a hardened container
//! specification builder, and exec plumbing with stdin and capped output
//! capture. Only available with the `containers` feature.

/// Docker/Podman API client with connection fallback and security probing.
pub mod client;

/// Hardened container specification for sandbox executions.
pub mod config;

/// Command execution inside running containers.
pub mod executor;

pub use client::{RuntimeClient, SecurityFacts};
pub use config::SandboxContainerSpec;
pub use executor::{ExecOutcome, exec_in_container};

/// Errors from the container runtime layer.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Neither Docker nor Podman could be reached
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Image missing locally and pulling is disabled or failed
    #[error("image not available: {0}")]
    ImageUnavailable(String),

    /// Underlying API error
    #[error("container API error: {0}")]
    Api(#[from] bollard::errors::Error),

    /// In-container command execution failed
    #[error("container execution error: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, ContainerError>;
