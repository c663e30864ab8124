use apex_core::cli::{self, Args, Command};
use clap::Parser;
use tracing::error;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("APEX_LOG").unwrap_or_else(|_| "apex_core=info".to_string()),
        )
        .init();

    let args = Args::parse();
    let config = match cli::load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(2);
        }
    };

    let outcome = match args.command {
        Command::Exec {
            file,
            lang,
            stdin_file,
            timeout_ms,
            backend,
        } => cli::run_exec(&config, file, lang, stdin_file, timeout_ms, backend).await,
        Command::Languages => {
            cli::run_languages();
            Ok(0)
        }
        Command::Doctor => cli::run_doctor(&config).await.map(|()| 0),
        Command::Config => cli::run_config(&config).map(|()| 0),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(2);
        }
    }
}
