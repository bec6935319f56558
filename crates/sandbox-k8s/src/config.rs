use std::time::Duration;

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// Namespace every environment pod is created in.
    pub namespace: String,
    pub image: String,
    /// Service account for environment pods. Its token is never mounted.
    pub service_account: Option<String>,
    /// Size of the memory-backed workspace volume, in MiB.
    pub workspace_size_mb: u32,
    /// Upper bound on how long `create` may wait for the pod to reach `Running`.
    pub provision_timeout: Duration,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            image: "onyxdotapp/python-executor-sci".into(),
            service_account: None,
            workspace_size_mb: 100,
            provision_timeout: Duration::from_secs(30),
        }
    }
}
