use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sandbox::layout::{INTERPRETER, KILL_ALL_SCRIPT, WORKSPACE_DIR, entrypoint_path, user_spec};
use sandbox::{
    Archive, Environment, KILLED_EXIT_CODE, Lifecycle, LifecycleState, OutputCollector,
    OutputStream, RawOutput, ResourceLimits, RunRequest, SandboxError,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::command::{exec_ignore_errors, exec_raw, exec_with_input};
use crate::process::{exit_code, kill_process_group};

/// Bound on staging and reading back the workspace.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the in-container kill issued after a timeout.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on reaping the local `docker exec` client after it has been killed.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// One dormant container, staged and run through `docker exec`.
pub struct DockerEnvironment {
    /// Cached `config.id.to_string()`.
    pub(crate) id: String,
    /// Container name, also used to address it in every CLI call.
    pub(crate) container: String,
    binary: String,
    resources: ResourceLimits,
    lifecycle: Lifecycle,
}

impl DockerEnvironment {
    pub(crate) fn new(
        id: String,
        container: String,
        binary: String,
        resources: ResourceLimits,
    ) -> Self {
        Self {
            id,
            container,
            binary,
            resources,
            lifecycle: Lifecycle::new(),
        }
    }

    /// `docker exec` prefix running as the sandbox identity.
    fn exec_args<'a>(&'a self, interactive: bool, user: &'a str) -> Vec<&'a str> {
        let mut args = vec!["exec"];
        if interactive {
            args.push("-i");
        }
        args.extend(["-u", user, "-w", WORKSPACE_DIR, self.container.as_str()]);
        args
    }

    /// SIGKILL every process the sandbox identity owns inside the container.
    async fn kill_user_processes(&self) {
        let user = user_spec();
        let mut args = self.exec_args(false, &user);
        args.extend(["sh", "-c", KILL_ALL_SCRIPT]);
        if tokio::time::timeout(KILL_TIMEOUT, exec_ignore_errors(&self.binary, &args))
            .await
            .is_err()
        {
            warn!(id = %self.id, "in-container kill timed out");
        }
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    async fn stage(&mut self, archive: &Archive) -> sandbox::Result<()> {
        self.lifecycle.ensure(LifecycleState::Staged)?;

        let user = user_spec();
        let mut args = self.exec_args(true, &user);
        args.extend(["tar", "-x", "-C", WORKSPACE_DIR]);
        tokio::time::timeout(
            TRANSFER_TIMEOUT,
            exec_with_input(&self.binary, &args, archive.as_bytes()),
        )
        .await
        .map_err(|_| SandboxError::Staging("timed out writing workspace".into()))?
        .map_err(|e| SandboxError::Staging(e.detail))?;

        self.lifecycle.advance(LifecycleState::Staged)?;
        debug!(id = %self.id, bytes = archive.len(), "workspace staged");
        Ok(())
    }

    async fn run(&mut self, request: &RunRequest<'_>) -> sandbox::Result<RawOutput> {
        self.lifecycle.advance(LifecycleState::Running)?;

        let user = user_spec();
        let entrypoint = entrypoint_path();
        let mut args = self.exec_args(true, &user);
        args.extend([INTERPRETER, entrypoint.as_str()]);

        let started = Instant::now();
        let spawned = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.lifecycle.advance(LifecycleState::RunFailed)?;
                return Err(SandboxError::Exec(format!("spawn {}: {e}", self.binary)));
            }
        };

        let mut stdout = OutputCollector::new(self.resources.max_output_bytes)
            .forward_to(OutputStream::Stdout, request.output.as_ref());
        let mut stderr = OutputCollector::new(self.resources.max_output_bytes)
            .forward_to(OutputStream::Stderr, request.output.as_ref());
        let stdin_pipe = child.stdin.take();
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let finished = tokio::time::timeout(request.timeout, async {
            let feed = async {
                if let Some(mut pipe) = stdin_pipe {
                    if let Some(data) = request.stdin
                        && let Err(e) = pipe.write_all(data).await
                    {
                        debug!(error = %e, "stdin closed early");
                    }
                    let _ = pipe.shutdown().await;
                }
            };
            let drain_stdout = async {
                if let Some(pipe) = stdout_pipe {
                    stdout.drain(pipe).await;
                }
            };
            let drain_stderr = async {
                if let Some(pipe) = stderr_pipe {
                    stderr.drain(pipe).await;
                }
            };
            let ((), (), (), status) = tokio::join!(feed, drain_stdout, drain_stderr, child.wait());
            status
        })
        .await;
        let duration = started.elapsed();

        let (exit_code, timed_out) = match finished {
            Ok(Ok(status)) => (exit_code(status), false),
            Ok(Err(e)) => {
                self.lifecycle.advance(LifecycleState::RunFailed)?;
                return Err(SandboxError::Exec(format!("wait for interpreter: {e}")));
            }
            Err(_) => {
                warn!(id = %self.id, timeout_ms = request.timeout.as_millis(), "execution timed out, killing");
                self.kill_user_processes().await;
                kill_process_group(&child);
                if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
                    warn!(id = %self.id, "exec client did not exit after kill");
                }
                (KILLED_EXIT_CODE, true)
            }
        };

        self.lifecycle.advance(if timed_out {
            LifecycleState::TimedOut
        } else {
            LifecycleState::Completed
        })?;
        info!(
            id = %self.id,
            exit_code,
            timed_out,
            duration_ms = duration.as_millis(),
            stdout_truncated = stdout.is_truncated(),
            stderr_truncated = stderr.is_truncated(),
            "execution finished"
        );

        Ok(RawOutput {
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
            exit_code,
            timed_out,
            duration,
        })
    }

    async fn extract(&mut self, exclude: &[&str]) -> sandbox::Result<Archive> {
        self.lifecycle.ensure(LifecycleState::Extracted)?;

        let user = user_spec();
        let mut args = self.exec_args(false, &user);
        args.extend(["tar", "-c", "-C", WORKSPACE_DIR, "."]);
        let bytes = tokio::time::timeout(TRANSFER_TIMEOUT, exec_raw(&self.binary, &args))
            .await
            .map_err(|_| SandboxError::Extraction("timed out reading workspace".into()))?
            .map_err(|e| SandboxError::Extraction(e.detail))?;
        let archive = sandbox::exclude_members(&Archive::from_bytes(bytes), exclude)?;

        self.lifecycle.advance(LifecycleState::Extracted)?;
        debug!(id = %self.id, bytes = archive.len(), "workspace extracted");
        Ok(archive)
    }
}
