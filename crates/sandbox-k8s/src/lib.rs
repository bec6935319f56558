mod config;
mod environment;
mod exec;
mod executor;
mod manifest;

pub use config::KubernetesConfig;
pub use environment::KubernetesEnvironment;
pub use executor::KubernetesExecutor;

use sandbox::SandboxError;

/// A refusal from the control plane is a provisioning fault. Anything else
/// means the control plane could not be reached.
pub(crate) fn api_failure(context: &str, err: kube::Error) -> SandboxError {
    match err {
        kube::Error::Api(response) => SandboxError::Provisioning(format!(
            "{context}: {} ({})",
            response.message, response.code
        )),
        other => SandboxError::Infrastructure(format!("{context}: {other}")),
    }
}
