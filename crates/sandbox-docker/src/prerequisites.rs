use std::time::Duration;

use sandbox::SandboxError;
use tracing::info;

use crate::command::exec;
use crate::config::DockerConfig;

/// Resolve the container CLI through `PATH`, as the shell would.
pub(crate) fn resolve_binary(binary: &str) -> Result<String, SandboxError> {
    which::which(binary)
        .map(|path| path.display().to_string())
        .map_err(|e| {
            SandboxError::Infrastructure(format!(
                "container CLI {binary:?} not found ({e}); set PYTHON_EXECUTOR_DOCKER_BIN \
                 if it is installed in a non-standard location"
            ))
        })
}

/// Bound on fetching a missing image at startup.
const PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Verify the daemon answers and the image is present, pulling it if not.
///
/// Images are never pulled at create time, so a missing image would otherwise
/// surface as a provisioning failure on every request.
pub(crate) async fn check_prerequisites(
    binary: &str,
    config: &DockerConfig,
) -> Result<(), SandboxError> {
    exec(binary, &["version", "--format", "{{.Server.Version}}"])
        .await
        .map_err(|e| {
            SandboxError::Infrastructure(format!("container daemon not reachable: {}", e.detail))
        })?;
    let image = config.image.as_str();
    if exec(binary, &["image", "inspect", "--format", "{{.Id}}", image])
        .await
        .is_ok()
    {
        return Ok(());
    }

    info!(image = %image, "image not present locally, pulling");
    let pulled = tokio::time::timeout(PULL_TIMEOUT, exec(binary, &["pull", image]))
        .await
        .map_err(|_| {
            SandboxError::Infrastructure(format!("pulling image {image} timed out"))
        })?;
    pulled.map_err(|e| {
        SandboxError::Infrastructure(format!("image {image} could not be pulled: {}", e.detail))
    })?;
    info!(image = %image, "image pulled");
    Ok(())
}
