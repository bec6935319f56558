use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{error, warn};

use crate::config::EnvironmentConfig;
use crate::environment::Environment;
use crate::error::{Result, SandboxError};
use crate::executor::Executor;
use crate::lifecycle::LifecycleState;
use crate::types::{Archive, RawOutput, RunRequest};

/// Owns an environment for the span of one request and guarantees it is destroyed.
///
/// The normal exit is [`EnvironmentGuard::release`]. If the guard is dropped
/// instead (an early `?` return, a panic, or the request future being
/// cancelled), `Drop` hands the environment to a background task that
/// destroys it. Either way `Executor::destroy` runs exactly once.
pub struct EnvironmentGuard {
    executor: Arc<dyn Executor>,
    environment: Option<Box<dyn Environment>>,
}

impl EnvironmentGuard {
    /// Provision an environment through `executor` and take ownership of it.
    pub async fn create(executor: Arc<dyn Executor>, config: EnvironmentConfig) -> Result<Self> {
        let environment = executor.create(config).await?;
        Ok(Self {
            executor,
            environment: Some(environment),
        })
    }

    pub fn id(&self) -> Option<&str> {
        self.environment.as_deref().map(|env| env.id())
    }

    pub fn state(&self) -> LifecycleState {
        self.environment
            .as_deref()
            .map_or(LifecycleState::Destroyed, |env| env.state())
    }

    fn live(&mut self, to: LifecycleState) -> Result<&mut Box<dyn Environment>> {
        self.environment
            .as_mut()
            .ok_or(SandboxError::InvalidState {
                from: LifecycleState::Destroyed,
                to,
            })
    }

    pub async fn stage(&mut self, archive: &Archive) -> Result<()> {
        self.live(LifecycleState::Staged)?.stage(archive).await
    }

    pub async fn run(&mut self, request: &RunRequest<'_>) -> Result<RawOutput> {
        self.live(LifecycleState::Running)?.run(request).await
    }

    pub async fn extract(&mut self, exclude: &[&str]) -> Result<Archive> {
        self.live(LifecycleState::Extracted)?.extract(exclude).await
    }

    /// Destroy the environment and wait for teardown to finish.
    pub async fn release(mut self) {
        if let Some(environment) = self.environment.take() {
            self.executor.destroy(environment).await;
        }
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        let Some(environment) = self.environment.take() else {
            return;
        };
        let id = environment.id().to_owned();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(id = %id, "environment dropped without release, destroying in background");
                let executor = Arc::clone(&self.executor);
                handle.spawn(async move {
                    executor.destroy(environment).await;
                });
            }
            Err(_) => {
                error!(id = %id, "no runtime to destroy environment, flagged for out-of-band cleanup");
            }
        }
    }
}

type Cleanup = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Teardown for an environment the runtime may already hold while `create`
/// is still waiting for it to become ready.
///
/// Backends arm one just before asking the runtime for the environment and
/// disarm it once the handle is built. If the `create` future is dropped in
/// between, `Drop` spawns the cleanup on the current runtime.
pub struct ProvisionGuard {
    name: String,
    cleanup: Option<Cleanup>,
}

impl ProvisionGuard {
    pub fn new<F>(name: impl Into<String>, cleanup: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            cleanup: Some(Box::pin(cleanup)),
        }
    }

    /// The environment now belongs to its handle.
    pub fn disarm(mut self) {
        self.cleanup = None;
    }

    /// Provisioning failed: run the cleanup now and wait for it.
    pub async fn cleanup(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.await;
        }
    }
}

impl Drop for ProvisionGuard {
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(name = %self.name, "provisioning abandoned, cleaning up in background");
                handle.spawn(cleanup);
            }
            Err(_) => {
                error!(name = %self.name, "no runtime to clean up abandoned environment, flagged for out-of-band cleanup");
            }
        }
    }
}
