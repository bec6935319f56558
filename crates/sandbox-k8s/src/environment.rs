use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use sandbox::layout::{INTERPRETER, KILL_ALL_SCRIPT, WORKSPACE_DIR, entrypoint_path};
use sandbox::{
    Archive, Environment, KILLED_EXIT_CODE, Lifecycle, LifecycleState, OutputCollector,
    OutputStream, RawOutput, ResourceLimits, RunRequest, SandboxError,
};
use tracing::{debug, info, warn};

use crate::exec::{ExecExit, exec};

/// Bound on staging and reading back the workspace.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the in-pod kill issued after a timeout.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Diagnostics kept from tar's stderr.
const TAR_STDERR_BYTES: usize = 4096;

/// Applies the CPU-time rlimit, then runs the entrypoint. With stdin attached,
/// exactly `$2` bytes are forwarded so the interpreter sees end-of-file even
/// though the exec stream itself stays open.
const RUN_WITH_STDIN: &str = r#"ulimit -t "$1" && head -c "$2" | "$3" "$4""#;
const RUN_WITHOUT_STDIN: &str = r#"ulimit -t "$1" && exec "$2" "$3""#;

/// Shell command that runs the entrypoint under the CPU-time rlimit.
///
/// The pod API has no rlimit field, so the limit is set by the exec'd shell.
fn run_command(cpu_time_secs: u32, stdin_len: Option<usize>) -> Vec<String> {
    let entrypoint = entrypoint_path();
    let mut command = vec!["sh".to_owned(), "-c".to_owned()];
    match stdin_len {
        Some(len) => command.extend([
            RUN_WITH_STDIN.to_owned(),
            "sh".to_owned(),
            cpu_time_secs.to_string(),
            len.to_string(),
            INTERPRETER.to_owned(),
            entrypoint,
        ]),
        None => command.extend([
            RUN_WITHOUT_STDIN.to_owned(),
            "sh".to_owned(),
            cpu_time_secs.to_string(),
            INTERPRETER.to_owned(),
            entrypoint,
        ]),
    }
    command
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| (*part).to_owned()).collect()
}

/// One dormant pod, driven entirely through exec streams.
pub struct KubernetesEnvironment {
    /// Cached `config.id.to_string()`.
    pub(crate) id: String,
    pub(crate) pod: String,
    pods: Api<Pod>,
    resources: ResourceLimits,
    /// Largest tar stream accepted back from the workspace.
    extract_limit: usize,
    lifecycle: Lifecycle,
}

impl KubernetesEnvironment {
    pub(crate) fn new(
        id: String,
        pod: String,
        pods: Api<Pod>,
        resources: ResourceLimits,
        extract_limit: usize,
    ) -> Self {
        Self {
            id,
            pod,
            pods,
            resources,
            extract_limit,
            lifecycle: Lifecycle::new(),
        }
    }

    /// SIGKILL every process of the sandbox identity except the pod's PID 1.
    async fn kill_user_processes(&self) {
        let mut stdout = OutputCollector::new(0);
        let mut stderr = OutputCollector::new(0);
        let command = strings(&["sh", "-c", KILL_ALL_SCRIPT]);
        match exec(
            &self.pods,
            &self.pod,
            command,
            None,
            &mut stdout,
            &mut stderr,
            Some(KILL_TIMEOUT),
        )
        .await
        {
            Ok(ExecExit::Exited(_)) => {}
            Ok(ExecExit::DeadlineExceeded) => warn!(id = %self.id, "in-pod kill timed out"),
            Err(e) => warn!(id = %self.id, error = %e, "in-pod kill failed"),
        }
    }
}

#[async_trait]
impl Environment for KubernetesEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    async fn stage(&mut self, archive: &Archive) -> sandbox::Result<()> {
        self.lifecycle.ensure(LifecycleState::Staged)?;

        let mut stdout = OutputCollector::new(0);
        let mut stderr = OutputCollector::new(TAR_STDERR_BYTES);
        let command = strings(&["tar", "-x", "-C", WORKSPACE_DIR]);
        let exit = exec(
            &self.pods,
            &self.pod,
            command,
            Some(archive.as_bytes()),
            &mut stdout,
            &mut stderr,
            Some(TRANSFER_TIMEOUT),
        )
        .await
        .map_err(|e| SandboxError::Staging(e.to_string()))?;
        match exit {
            ExecExit::Exited(0) => {}
            ExecExit::Exited(code) => {
                return Err(SandboxError::Staging(format!(
                    "tar exited with {code}: {}",
                    String::from_utf8_lossy(stderr.as_bytes()).trim()
                )));
            }
            ExecExit::DeadlineExceeded => {
                return Err(SandboxError::Staging("timed out writing workspace".into()));
            }
        }

        self.lifecycle.advance(LifecycleState::Staged)?;
        debug!(id = %self.id, bytes = archive.len(), "workspace staged");
        Ok(())
    }

    async fn run(&mut self, request: &RunRequest<'_>) -> sandbox::Result<RawOutput> {
        self.lifecycle.advance(LifecycleState::Running)?;

        let stdin = request.stdin.filter(|data| !data.is_empty());
        let command = run_command(
            self.resources.effective_cpu_time_secs(),
            stdin.map(<[u8]>::len),
        );
        let mut stdout = OutputCollector::new(self.resources.max_output_bytes)
            .forward_to(OutputStream::Stdout, request.output.as_ref());
        let mut stderr = OutputCollector::new(self.resources.max_output_bytes)
            .forward_to(OutputStream::Stderr, request.output.as_ref());

        let started = Instant::now();
        let exit = exec(
            &self.pods,
            &self.pod,
            command,
            stdin,
            &mut stdout,
            &mut stderr,
            Some(request.timeout),
        )
        .await;
        let duration = started.elapsed();
        let (exit_code, timed_out) = match exit {
            Ok(ExecExit::Exited(code)) => (code, false),
            Ok(ExecExit::DeadlineExceeded) => {
                warn!(id = %self.id, timeout_ms = request.timeout.as_millis(), "execution timed out, killing");
                self.kill_user_processes().await;
                (KILLED_EXIT_CODE, true)
            }
            Err(e) => {
                self.lifecycle.advance(LifecycleState::RunFailed)?;
                return Err(SandboxError::Exec(e.to_string()));
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

        let mut stdout = OutputCollector::new(self.extract_limit);
        let mut stderr = OutputCollector::new(TAR_STDERR_BYTES);
        let command = strings(&["tar", "-c", "-C", WORKSPACE_DIR, "."]);
        let exit = exec(
            &self.pods,
            &self.pod,
            command,
            None,
            &mut stdout,
            &mut stderr,
            Some(TRANSFER_TIMEOUT),
        )
        .await
        .map_err(|e| SandboxError::Extraction(e.to_string()))?;
        match exit {
            ExecExit::Exited(0) => {}
            ExecExit::Exited(code) => {
                return Err(SandboxError::Extraction(format!(
                    "tar exited with {code}: {}",
                    String::from_utf8_lossy(stderr.as_bytes()).trim()
                )));
            }
            ExecExit::DeadlineExceeded => {
                return Err(SandboxError::Extraction("timed out reading workspace".into()));
            }
        }
        if stdout.is_truncated() {
            return Err(SandboxError::Extraction(format!(
                "workspace archive exceeds {} bytes",
                self.extract_limit
            )));
        }

        let archive = sandbox::exclude_members(&Archive::from_bytes(stdout.into_bytes()), exclude)?;
        self.lifecycle.advance(LifecycleState::Extracted)?;
        debug!(id = %self.id, bytes = archive.len(), "workspace extracted");
        Ok(archive)
    }
}
