use crate::lifecycle::LifecycleState;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Malformed request input. Raised before any environment exists.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The environment never became ready. No user code ran, so retrying is safe.
    #[error("environment provisioning failed: {0}")]
    Provisioning(String),

    #[error("staging failed: {0}")]
    Staging(String),

    #[error("execution failed: {0}")]
    Exec(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The runtime or control plane could not be reached.
    #[error("backend unreachable: {0}")]
    Infrastructure(String),

    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidState {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// `true` when the error happened before any user code could run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provisioning(_))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
