use async_trait::async_trait;

use crate::config::EnvironmentConfig;
use crate::environment::Environment;
use crate::error::Result;

/// A backend able to provision and tear down isolated environments.
///
/// Implementations hold no per-request state; one instance is shared by every
/// in-flight request and each request gets its own [`Environment`].
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable name for this backend (e.g. "docker").
    fn name(&self) -> &str;
    /// Verify the backend is reachable and usable. Called once at process start.
    async fn startup(&self) -> Result<()>;
    /// Remove environments left behind by an earlier process whose in-band
    /// destroy never ran. Returns how many were removed.
    async fn sweep_stale(&self) -> Result<usize>;
    /// Provision a new environment with its resource limits already applied.
    ///
    /// Fails with [`crate::SandboxError::Provisioning`] when the environment
    /// does not become ready within the backend's bounded wait.
    async fn create(&self, config: EnvironmentConfig) -> Result<Box<dyn Environment>>;
    /// Tear down an environment from whatever state it is in.
    ///
    /// Never fails: problems are logged, since a result has usually already
    /// been produced by the time this runs.
    async fn destroy(&self, environment: Box<dyn Environment>);
}
