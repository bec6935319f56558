use std::process::{Output, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// Format a human-readable display string for a direct command invocation.
fn format_command_display(program: &str, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Spawn `program`, optionally feed `input` on stdin, and collect its output.
async fn run(program: &str, args: &[&str], input: Option<&[u8]>) -> Result<Output, CommandError> {
    let cmd_display = format_command_display(program, args);
    let spawn_err = |e: std::io::Error| CommandError {
        command: cmd_display.clone(),
        detail: e.to_string(),
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(spawn_err)?;

    let stdin = child.stdin.take();
    let feed = async move {
        if let (Some(mut pipe), Some(data)) = (stdin, input) {
            // The reader may exit early; its exit status is what gets reported.
            if let Err(e) = pipe.write_all(data).await {
                trace!(error = %e, "stdin write interrupted");
            }
            let _ = pipe.shutdown().await;
        }
    };
    let ((), output) = tokio::join!(feed, child.wait_with_output());
    output.map_err(spawn_err)
}

fn failure(program: &str, args: &[&str], output: &Output) -> CommandError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    CommandError {
        command: format_command_display(program, args),
        detail: if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr
        },
    }
}

/// Execute a command.
///
/// Invokes the program binary directly with the given arguments.
/// Returns trimmed stdout on success.
pub async fn exec(program: &str, args: &[&str]) -> Result<String, CommandError> {
    trace!(command = %format_command_display(program, args), "exec");
    let output = run(program, args, None).await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(failure(program, args, &output))
    }
}

/// Execute a command, writing `input` to its stdin. Returns raw stdout bytes.
pub async fn exec_with_input(
    program: &str,
    args: &[&str],
    input: &[u8],
) -> Result<Vec<u8>, CommandError> {
    trace!(command = %format_command_display(program, args), bytes = input.len(), "exec with input");
    let output = run(program, args, Some(input)).await?;
    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(failure(program, args, &output))
    }
}

/// Execute a command and return raw stdout bytes, untrimmed.
pub async fn exec_raw(program: &str, args: &[&str]) -> Result<Vec<u8>, CommandError> {
    trace!(command = %format_command_display(program, args), "exec raw");
    let output = run(program, args, None).await?;
    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(failure(program, args, &output))
    }
}

/// Execute a command, ignoring any errors.
pub async fn exec_ignore_errors(program: &str, args: &[&str]) {
    let cmd_display = format_command_display(program, args);
    trace!(command = %cmd_display, "exec_ignore_errors");

    match run(program, args, None).await {
        Ok(o) if !o.status.success() => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            trace!(command = %cmd_display, stderr = %stderr.trim(), "command failed (ignored)");
        }
        Err(e) => {
            trace!(command = %cmd_display, error = %e, "command failed to spawn (ignored)");
        }
        _ => {}
    }
}
