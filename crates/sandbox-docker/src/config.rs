use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Container CLI to invoke. Resolved through `PATH` when not absolute.
    pub binary: String,
    /// Image every environment is created from. Pulled at startup when missing.
    pub image: String,
    /// Extra `docker run` arguments inserted before the image name.
    pub extra_run_args: Vec<String>,
    /// Size of the memory-backed workspace mount, in MiB.
    pub workspace_size_mb: u32,
    /// Upper bound on how long `create` may wait for the container to run.
    pub provision_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".into(),
            image: "onyxdotapp/python-executor-sci".into(),
            extra_run_args: Vec::new(),
            workspace_size_mb: 100,
            provision_timeout: Duration::from_secs(30),
        }
    }
}
