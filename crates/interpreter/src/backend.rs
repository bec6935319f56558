use std::sync::Arc;

use sandbox::Executor;
use sandbox_docker::DockerExecutor;
use sandbox_k8s::KubernetesExecutor;
use tracing::{info, warn};

use crate::config::{Backend, ServiceConfig};
use crate::error::ServiceResult;

/// Build the configured backend, check it is usable and clear leftovers from
/// an earlier process. Runs once at startup.
pub async fn connect(config: &ServiceConfig) -> ServiceResult<Arc<dyn Executor>> {
    let executor: Arc<dyn Executor> = match config.backend {
        Backend::Docker => Arc::new(DockerExecutor::new(config.docker_config())?),
        Backend::Kubernetes => Arc::new(KubernetesExecutor::new(config.kubernetes_config()).await?),
    };
    executor.startup().await?;

    match executor.sweep_stale().await {
        Ok(0) => {}
        Ok(removed) => info!(backend = executor.name(), removed, "removed stale environments"),
        Err(e) => warn!(backend = executor.name(), error = %e, "stale environment sweep failed"),
    }

    info!(backend = executor.name(), "executor ready");
    Ok(executor)
}
