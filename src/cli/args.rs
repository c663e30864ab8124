//! Command-line argument definitions.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::sandbox::BackendKind;

/// Apex execution core.
#[derive(Debug, Parser)]
#[command(name = "apex-core", version, about = "Apex platform execution core")]
pub struct Args {
    /// Path to a configuration file (overrides discovery)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Backend choice on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackendArg {
    Process,
    Container,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Process => BackendKind::Process,
            BackendArg::Container => BackendKind::Container,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a source file through the sandbox and print the result as JSON
    Exec {
        /// File to execute
        file: PathBuf,

        /// Language tag; inferred from the extension when omitted
        #[arg(long)]
        lang: Option<String>,

        /// File whose contents are piped to stdin
        #[arg(long)]
        stdin_file: Option<PathBuf>,

        /// Wall-clock cap in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Pin the execution to one backend
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
    },

    /// List supported languages
    Languages,

    /// Probe sandbox capabilities and print the facts report
    Doctor,

    /// Print the effective configuration as TOML
    Config,
}
