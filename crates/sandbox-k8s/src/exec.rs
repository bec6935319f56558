//! Exec-stream plumbing shared by staging, running and extraction.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::Api;
use kube::api::AttachParams;
use sandbox::{OutputCollector, SandboxError};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::manifest::CONTAINER_NAME;

/// How an exec session ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ExecExit {
    Exited(i32),
    /// The deadline passed first. The session has been aborted.
    DeadlineExceeded,
}

/// Exit code carried by the exec status channel.
///
/// A missing status means the stream was cut before the command finished.
/// A failure other than a non-zero exit means the command never ran.
pub(crate) fn exit_code(status: Option<Status>) -> Result<i32, SandboxError> {
    let status =
        status.ok_or_else(|| SandboxError::Exec("exec stream closed without a status".into()))?;
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }
    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let code = status
            .details
            .and_then(|details| details.causes)
            .unwrap_or_default()
            .into_iter()
            .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
            .and_then(|cause| cause.message)
            .and_then(|message| message.trim().parse().ok())
            .unwrap_or(1);
        return Ok(code);
    }
    Err(SandboxError::Exec(
        status
            .message
            .unwrap_or_else(|| "exec failed without a message".into()),
    ))
}

/// Run `command` in the environment container, streaming `stdin` in and both
/// output streams into their collectors.
///
/// Output read before a deadline is kept in the collectors either way.
pub(crate) async fn exec(
    pods: &Api<Pod>,
    pod: &str,
    command: Vec<String>,
    stdin: Option<&[u8]>,
    stdout: &mut OutputCollector,
    stderr: &mut OutputCollector,
    deadline: Option<Duration>,
) -> Result<ExecExit, SandboxError> {
    let params = AttachParams::default()
        .container(CONTAINER_NAME)
        .stdin(stdin.is_some())
        .stdout(true)
        .stderr(true);
    let mut process = pods
        .exec(pod, command, &params)
        .await
        .map_err(|e| crate::api_failure("exec", e))?;

    let status = process.take_status();
    let stdin_writer = process.stdin();
    let stdout_reader = process.stdout();
    let stderr_reader = process.stderr();

    let session = async {
        let feed = async {
            if let (Some(mut writer), Some(data)) = (stdin_writer, stdin) {
                if let Err(e) = writer.write_all(data).await {
                    debug!(pod = %pod, error = %e, "exec stdin closed early");
                }
                let _ = writer.shutdown().await;
            }
        };
        let drain_stdout = async {
            if let Some(reader) = stdout_reader {
                stdout.drain(reader).await;
            }
        };
        let drain_stderr = async {
            if let Some(reader) = stderr_reader {
                stderr.drain(reader).await;
            }
        };
        let wait_status = async {
            match status {
                Some(status) => status.await,
                None => None,
            }
        };
        let ((), (), (), status) = tokio::join!(feed, drain_stdout, drain_stderr, wait_status);
        status
    };

    let status = match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, session).await {
            Ok(status) => status,
            Err(_) => {
                process.abort();
                return Ok(ExecExit::DeadlineExceeded);
            }
        },
        None => session.await,
    };
    if let Err(e) = process.join().await {
        debug!(pod = %pod, error = %e, "exec session ended with error");
    }
    exit_code(status).map(ExecExit::Exited)
}
