use std::any::Any;

use async_trait::async_trait;

use crate::error::Result;
use crate::lifecycle::LifecycleState;
use crate::types::{Archive, RawOutput, RunRequest};

/// Handle to one ephemeral, isolated environment.
///
/// Each handle serves exactly one request. Operations must be called in
/// lifecycle order (`stage` -> `run` -> `extract`); out-of-order calls fail with
/// [`crate::SandboxError::InvalidState`]. Teardown goes through
/// [`crate::Executor::destroy`], which consumes the handle.
///
/// The `Any` bound allows `Executor::destroy()` to downcast
/// `Box<dyn Environment>` back to the concrete type for backend-specific cleanup.
#[async_trait]
pub trait Environment: Send + Sync + Any {
    // -- identity --
    fn id(&self) -> &str;
    fn state(&self) -> LifecycleState;

    // -- operations --
    /// Unpack `archive` into the workspace, preserving ownership and modes.
    async fn stage(&mut self, archive: &Archive) -> Result<()>;
    /// Run the entrypoint as the unprivileged identity under a wall-clock timeout.
    ///
    /// Timeouts are reported through [`RawOutput::timed_out`], not as errors.
    async fn run(&mut self, request: &RunRequest<'_>) -> Result<RawOutput>;
    /// Read back the workspace as a tar stream. Paths listed in `exclude`
    /// (relative to the workspace root) must not appear in the result.
    async fn extract(&mut self, exclude: &[&str]) -> Result<Archive>;
}
