use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use sandbox::{
    Environment, EnvironmentConfig, Executor, ProvisionGuard, ResourceLimits, SandboxError,
};
use tracing::{debug, info, warn};

use crate::api_failure;
use crate::config::KubernetesConfig;
use crate::environment::KubernetesEnvironment;
use crate::manifest::{build_pod, managed_selector, pod_name};

/// Interval between phase checks while a pod starts.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Container waiting reasons that will not resolve on their own.
const FATAL_WAITING_REASONS: [&str; 5] = [
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
];

const MIB: u64 = 1024 * 1024;

enum Readiness {
    Running,
    Pending,
    Failed(String),
}

fn readiness(pod: &Pod) -> Readiness {
    let Some(status) = pod.status.as_ref() else {
        return Readiness::Pending;
    };
    match status.phase.as_deref() {
        Some("Running") => return Readiness::Running,
        Some(phase @ ("Failed" | "Succeeded")) => {
            return Readiness::Failed(format!("pod entered phase {phase}"));
        }
        _ => {}
    }
    let waiting = status
        .container_statuses
        .iter()
        .flatten()
        .filter_map(|c| c.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
        .find(|reason| FATAL_WAITING_REASONS.contains(reason));
    match waiting {
        Some(reason) => Readiness::Failed(format!("container cannot start: {reason}")),
        None => Readiness::Pending,
    }
}

/// Delete a pod with no grace period. A pod that is already gone counts as deleted.
async fn delete_pod(pods: &Api<Pod>, name: &str) -> bool {
    let params = DeleteParams {
        grace_period_seconds: Some(0),
        ..DeleteParams::default()
    };
    match pods.delete(name, &params).await {
        Ok(_) => true,
        Err(kube::Error::Api(response)) if response.code == 404 => true,
        Err(e) => {
            warn!(pod = %name, error = %e, "failed to delete pod");
            false
        }
    }
}

/// The pod spec has no per-pod process ceiling; the node's kubelet
/// `podPidsLimit` is what bounds forks here.
fn log_process_ceiling(pod: &str, limits: &ResourceLimits) {
    debug!(
        pod = %pod,
        max_processes = limits.max_processes,
        "process ceiling not applied per pod, relying on kubelet podPidsLimit"
    );
}

/// Runs each environment as a dormant pod on a cluster.
pub struct KubernetesExecutor {
    config: KubernetesConfig,
    pods: Api<Pod>,
}

impl KubernetesExecutor {
    /// Connect with the in-cluster service account, falling back to the local kubeconfig.
    pub async fn new(config: KubernetesConfig) -> sandbox::Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| SandboxError::Infrastructure(format!("cluster client: {e}")))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: KubernetesConfig) -> Self {
        let pods = Api::namespaced(client, &config.namespace);
        Self { config, pods }
    }

    fn extract_limit(&self) -> usize {
        usize::try_from(u64::from(self.config.workspace_size_mb) * 2 * MIB).unwrap_or(usize::MAX)
    }

    async fn wait_until_running(&self, name: &str) -> sandbox::Result<()> {
        loop {
            match self.pods.get(name).await {
                Ok(pod) => match readiness(&pod) {
                    Readiness::Running => return Ok(()),
                    Readiness::Failed(reason) => return Err(SandboxError::Provisioning(reason)),
                    Readiness::Pending => debug!(pod = %name, "pod not running yet"),
                },
                Err(kube::Error::Api(response)) if response.code == 404 => {
                    debug!(pod = %name, "pod not visible yet");
                }
                Err(e) => return Err(api_failure("read pod", e)),
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn provision(&self, name: &str, config: &EnvironmentConfig) -> sandbox::Result<()> {
        let pod = build_pod(&self.config, name, config)?;
        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| api_failure("create pod", e))?;
        self.wait_until_running(name).await
    }

    /// Deletes `name` unless disarmed, including when `create` is dropped mid-flight.
    fn pending_deletion(&self, name: &str) -> ProvisionGuard {
        let pods = self.pods.clone();
        let pod = name.to_owned();
        ProvisionGuard::new(name, async move {
            delete_pod(&pods, &pod).await;
        })
    }
}

#[async_trait]
impl Executor for KubernetesExecutor {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn startup(&self) -> sandbox::Result<()> {
        self.pods
            .list(&ListParams::default().limit(1))
            .await
            .map_err(|e| {
                SandboxError::Infrastructure(format!(
                    "cannot list pods in namespace {}: {e}",
                    self.config.namespace
                ))
            })?;
        info!(namespace = %self.config.namespace, image = %self.config.image, "executor started");
        Ok(())
    }

    async fn sweep_stale(&self) -> sandbox::Result<usize> {
        let params = ListParams::default()
            .labels(&managed_selector())
            .fields("status.phase!=Running,status.phase!=Pending");
        let stale = self
            .pods
            .list(&params)
            .await
            .map_err(|e| SandboxError::Infrastructure(format!("list pods: {e}")))?;

        let mut removed = 0;
        for pod in stale.items {
            let Some(name) = pod.metadata.name else {
                continue;
            };
            if delete_pod(&self.pods, &name).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept stale pods");
        }
        Ok(removed)
    }

    async fn create(&self, config: EnvironmentConfig) -> sandbox::Result<Box<dyn Environment>> {
        let id = config.id.to_string();
        let name = pod_name(&config);
        log_process_ceiling(&name, &config.resources);

        // The pod may exist even though it never became ready.
        let pending = self.pending_deletion(&name);
        let provisioned =
            tokio::time::timeout(self.config.provision_timeout, self.provision(&name, &config))
                .await
                .unwrap_or_else(|_| {
                    Err(SandboxError::Provisioning(format!(
                        "pod not running after {:?}",
                        self.config.provision_timeout
                    )))
                });
        if let Err(e) = provisioned {
            pending.cleanup().await;
            return Err(e);
        }
        pending.disarm();

        info!(id = %id, pod = %name, "environment created");
        Ok(Box::new(KubernetesEnvironment::new(
            id,
            name,
            self.pods.clone(),
            config.resources,
            self.extract_limit(),
        )))
    }

    async fn destroy(&self, environment: Box<dyn Environment>) {
        let environment =
            match (environment as Box<dyn std::any::Any>).downcast::<KubernetesEnvironment>() {
                Ok(env) => *env,
                Err(_) => {
                    warn!("destroy called with non-kubernetes environment, ignoring");
                    return;
                }
            };

        if delete_pod(&self.pods, &environment.pod).await {
            info!(id = %environment.id, "environment destroyed");
        } else {
            warn!(
                id = %environment.id,
                pod = %environment.pod,
                "pod left behind, it expires at its active deadline or the next sweep"
            );
        }
    }
}
