//! Command execution inside running containers.
//!
//! Exec plumbing shared by the container backend: create an exec instance,
//! feed stdin through the attached input stream, demultiplex stdout/stderr
//! with per-stream caps, and read the exit code back.

use super::{ContainerError, Result};
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::stream::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Output of one in-container command.
#[derive(Debug, Default)]
pub struct ExecOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// None when the runtime did not report an exit code
    pub exit_code: Option<i64>,
}

/// Run `argv` inside `container_id`, writing `stdin` to the process and
/// capturing at most `max_output_bytes` per stream.
///
/// # Errors
///
/// Returns an error when the exec instance cannot be created or its output
/// stream fails mid-read.
pub async fn exec_in_container(
    docker: &Docker,
    container_id: &str,
    argv: &[String],
    stdin: &[u8],
    working_dir: &str,
    max_output_bytes: usize,
) -> Result<ExecOutcome> {
    debug!(container = &container_id[..container_id.len().min(12)], ?argv, "container exec");

    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(argv.to_vec()),
                working_dir: Some(working_dir.to_string()),
                attach_stdin: Some(!stdin.is_empty()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await?;

    let started = docker.start_exec(&exec.id, None).await?;

    let mut outcome = ExecOutcome::default();
    match started {
        StartExecResults::Attached { mut output, mut input } => {
            if !stdin.is_empty() {
                // Stdin is written while output drains so neither side can
                // stall on a full pipe.
                let payload = stdin.to_vec();
                tokio::spawn(async move {
                    let _ = input.write_all(&payload).await;
                    let _ = input.shutdown().await;
                });
            }

            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => append_capped(
                        &mut outcome.stdout,
                        &message,
                        max_output_bytes,
                        &mut outcome.stdout_truncated,
                    ),
                    Ok(LogOutput::StdErr { message }) => append_capped(
                        &mut outcome.stderr,
                        &message,
                        max_output_bytes,
                        &mut outcome.stderr_truncated,
                    ),
                    Ok(_) => {}
                    Err(e) => {
                        return Err(ContainerError::Execution(format!(
                            "output stream failed: {e}"
                        )));
                    }
                }
            }
        }
        StartExecResults::Detached => {
            return Err(ContainerError::Execution(
                "unexpected detached exec".to_string(),
            ));
        }
    }

    let inspect = docker.inspect_exec(&exec.id).await?;
    outcome.exit_code = inspect.exit_code;

    debug!(exit_code = ?outcome.exit_code, "container exec finished");
    Ok(outcome)
}

fn append_capped(buffer: &mut Vec<u8>, chunk: &[u8], cap: usize, truncated: &mut bool) {
    if buffer.len() < cap {
        let take = chunk.len().min(cap - buffer.len());
        buffer.extend_from_slice(&chunk[..take]);
        if take < chunk.len() {
            *truncated = true;
        }
    } else if !chunk.is_empty() {
        *truncated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_capped() {
        let mut buffer = Vec::new();
        let mut truncated = false;

        append_capped(&mut buffer, b"hello", 8, &mut truncated);
        assert_eq!(buffer, b"hello");
        assert!(!truncated);

        append_capped(&mut buffer, b"world", 8, &mut truncated);
        assert_eq!(buffer, b"hellowor");
        assert!(truncated);

        append_capped(&mut buffer, b"more", 8, &mut truncated);
        assert_eq!(buffer.len(), 8);
    }
}
