use std::time::Duration;

use async_trait::async_trait;
use sandbox::layout::{
    INTERPRETER_ENV, MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE, SANDBOX_GID, SANDBOX_UID, TMP_SIZE_MB,
    WORKSPACE_DIR,
};
use sandbox::{Environment, EnvironmentConfig, Executor, ProvisionGuard, SandboxError};
use tracing::{debug, info, warn};

use crate::command::exec;
use crate::config::DockerConfig;
use crate::environment::DockerEnvironment;
use crate::prerequisites::{check_prerequisites, resolve_binary};

/// Interval between readiness checks while a container starts.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bound on `docker rm -f` against an unresponsive daemon.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Container name for an environment id.
fn container_name(config: &EnvironmentConfig) -> String {
    format!("code-exec-{}", config.id.simple())
}

fn managed_label() -> String {
    format!("{MANAGED_LABEL_KEY}={MANAGED_LABEL_VALUE}")
}

/// A daemon that cannot be reached is an infrastructure fault, anything else
/// about `docker run` failing is a provisioning fault.
fn run_failure(detail: &str) -> SandboxError {
    if detail.contains("Cannot connect to the Docker daemon") || detail.contains("error during connect")
    {
        SandboxError::Infrastructure(format!("docker run: {detail}"))
    } else {
        SandboxError::Provisioning(format!("docker run: {detail}"))
    }
}

/// Full `docker run` argument list for a dormant environment container.
///
/// Resource ceilings are applied here, at creation, so they are in force
/// before anything is staged.
fn run_args(docker: &DockerConfig, name: &str, config: &EnvironmentConfig) -> Vec<String> {
    let limits = &config.resources;
    let memory = format!("{}m", limits.effective_memory_mb());
    let cpu = limits.effective_cpu_time_secs();

    let mut args: Vec<String> = [
        "run",
        "-d",
        "--rm",
        "--pull",
        "never",
        "--network",
        "none",
        "--security-opt",
        "no-new-privileges",
        "--cap-drop",
        "ALL",
        "--cap-add",
        "CHOWN",
        "--workdir",
        WORKSPACE_DIR,
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();

    args.extend([
        "--name".into(),
        name.to_owned(),
        "--label".into(),
        managed_label(),
        "--pids-limit".into(),
        limits.max_processes.to_string(),
        "--tmpfs".into(),
        format!("/tmp:rw,size={TMP_SIZE_MB}m"),
        "--tmpfs".into(),
        format!(
            "{WORKSPACE_DIR}:rw,size={}m,uid={SANDBOX_UID},gid={SANDBOX_GID}",
            docker.workspace_size_mb
        ),
        "--ulimit".into(),
        format!("cpu={cpu}:{cpu}"),
        "--memory".into(),
        memory.clone(),
        "--memory-swap".into(),
        memory,
    ]);
    for (key, value) in INTERPRETER_ENV {
        args.push("--env".into());
        args.push(format!("{key}={value}"));
    }
    args.extend(docker.extra_run_args.iter().cloned());
    args.extend([
        docker.image.clone(),
        "sleep".into(),
        config.lifetime.as_secs().max(1).to_string(),
    ]);
    args
}

/// Force-remove a container. A container that is already gone counts as removed.
async fn remove_container(binary: &str, name: &str) -> bool {
    match tokio::time::timeout(REMOVE_TIMEOUT, exec(binary, &["rm", "-f", name])).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) if e.detail.contains("No such container") => true,
        Ok(Err(e)) => {
            warn!(container = %name, error = %e.detail, "failed to remove container");
            false
        }
        Err(_) => {
            warn!(container = %name, timeout_secs = REMOVE_TIMEOUT.as_secs(), "container removal timed out");
            false
        }
    }
}

/// Runs each environment as a dormant container on the local daemon.
pub struct DockerExecutor {
    config: DockerConfig,
    /// Absolute path of the container CLI.
    binary: String,
}

impl DockerExecutor {
    /// Resolve the container CLI without touching the daemon.
    /// Call `startup()` to verify the daemon before use.
    pub fn new(config: DockerConfig) -> sandbox::Result<Self> {
        let binary = resolve_binary(&config.binary)?;
        Ok(Self { config, binary })
    }

    async fn wait_until_running(&self, name: &str) -> sandbox::Result<()> {
        loop {
            match exec(&self.binary, &["inspect", "--format", "{{.State.Running}}", name]).await {
                Ok(running) if running == "true" => return Ok(()),
                Ok(state) => debug!(container = %name, state = %state, "container not running yet"),
                Err(e) => debug!(container = %name, error = %e.detail, "container not inspectable yet"),
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn provision(&self, name: &str, config: &EnvironmentConfig) -> sandbox::Result<()> {
        let args = run_args(&self.config, name, config);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        exec(&self.binary, &args)
            .await
            .map_err(|e| run_failure(&e.detail))?;
        self.wait_until_running(name).await
    }

    /// Cleanup armed before `docker run` and disarmed once the handle exists.
    fn pending_removal(&self, name: &str) -> ProvisionGuard {
        let binary = self.binary.clone();
        let container = name.to_owned();
        ProvisionGuard::new(name, async move {
            remove_container(&binary, &container).await;
        })
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    fn name(&self) -> &str {
        "docker"
    }

    async fn startup(&self) -> sandbox::Result<()> {
        check_prerequisites(&self.binary, &self.config).await?;
        info!(binary = %self.binary, image = %self.config.image, "executor started");
        Ok(())
    }

    async fn sweep_stale(&self) -> sandbox::Result<usize> {
        let label = format!("label={}", managed_label());
        let listed = exec(
            &self.binary,
            &[
                "ps", "-aq", "--filter", label.as_str(), "--filter", "status=created", "--filter",
                "status=exited", "--filter", "status=dead",
            ],
        )
        .await
        .map_err(|e| SandboxError::Infrastructure(format!("list containers: {}", e.detail)))?;

        let mut removed = 0;
        for container in listed.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if remove_container(&self.binary, container).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept stale containers");
        }
        Ok(removed)
    }

    async fn create(&self, config: EnvironmentConfig) -> sandbox::Result<Box<dyn Environment>> {
        let id = config.id.to_string();
        let name = container_name(&config);

        let pending = self.pending_removal(&name);
        let provisioned =
            tokio::time::timeout(self.config.provision_timeout, self.provision(&name, &config))
                .await
                .unwrap_or_else(|_| {
                    Err(SandboxError::Provisioning(format!(
                        "container not running after {:?}",
                        self.config.provision_timeout
                    )))
                });
        if let Err(e) = provisioned {
            // `docker run` may have created the container before failing.
            pending.cleanup().await;
            return Err(e);
        }
        pending.disarm();

        info!(id = %id, container = %name, "environment created");
        Ok(Box::new(DockerEnvironment::new(
            id,
            name,
            self.binary.clone(),
            config.resources,
        )))
    }

    async fn destroy(&self, environment: Box<dyn Environment>) {
        let environment =
            match (environment as Box<dyn std::any::Any>).downcast::<DockerEnvironment>() {
                Ok(env) => *env,
                Err(_) => {
                    warn!("destroy called with non-docker environment, ignoring");
                    return;
                }
            };

        if remove_container(&self.binary, &environment.container).await {
            info!(id = %environment.id, "environment destroyed");
        } else {
            warn!(
                id = %environment.id,
                container = %environment.container,
                "container left behind, it expires with its lifetime or the next sweep"
            );
        }
    }
}
