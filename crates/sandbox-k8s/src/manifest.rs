use k8s_openapi::api::core::v1::Pod;
use sandbox::layout::{
    INTERPRETER_ENV, MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE, SANDBOX_GID, SANDBOX_UID, TMP_SIZE_MB,
    WORKSPACE_DIR,
};
use sandbox::{EnvironmentConfig, SandboxError};
use serde_json::json;

use crate::config::KubernetesConfig;

/// Name of the single container in every environment pod.
pub(crate) const CONTAINER_NAME: &str = "executor";

/// Memory request never exceeds this many MiB, whatever the limit.
const MEMORY_REQUEST_CAP_MB: u32 = 64;

pub(crate) fn pod_name(config: &EnvironmentConfig) -> String {
    format!("code-exec-{}", config.id.simple())
}

pub(crate) fn managed_selector() -> String {
    format!("{MANAGED_LABEL_KEY}={MANAGED_LABEL_VALUE}")
}

/// Pod manifest for one dormant environment.
///
/// The pod runs as the sandbox identity with every capability dropped, keeps
/// its workspace and `/tmp` in memory, and carries no service account token.
/// `activeDeadlineSeconds` matches the idle command so a pod whose delete was
/// never issued is still stopped by the kubelet.
pub(crate) fn pod_manifest(
    k8s: &KubernetesConfig,
    name: &str,
    config: &EnvironmentConfig,
) -> serde_json::Value {
    let limits = &config.resources;
    let memory = limits.effective_memory_mb();
    let lifetime = config.lifetime.as_secs().max(1);
    let env: Vec<serde_json::Value> = INTERPRETER_ENV
        .iter()
        .map(|(key, value)| json!({ "name": key, "value": value }))
        .collect();

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": k8s.namespace,
            "labels": {
                "app": "code-interpreter",
                "component": "executor",
                (MANAGED_LABEL_KEY): MANAGED_LABEL_VALUE,
            },
        },
        "spec": {
            "restartPolicy": "Never",
            "activeDeadlineSeconds": lifetime,
            "automountServiceAccountToken": false,
            "enableServiceLinks": false,
            "serviceAccountName": k8s.service_account,
            "securityContext": {
                "runAsNonRoot": true,
                "runAsUser": SANDBOX_UID,
                "runAsGroup": SANDBOX_GID,
                "fsGroup": SANDBOX_GID,
                "seccompProfile": { "type": "RuntimeDefault" },
            },
            "containers": [{
                "name": CONTAINER_NAME,
                "image": k8s.image,
                "command": ["sleep", lifetime.to_string()],
                "workingDir": WORKSPACE_DIR,
                "env": env,
                "resources": {
                    "limits": {
                        "memory": format!("{memory}Mi"),
                        "cpu": "1",
                    },
                    "requests": {
                        "memory": format!("{}Mi", memory.min(MEMORY_REQUEST_CAP_MB)),
                        "cpu": "100m",
                    },
                },
                "securityContext": {
                    "runAsUser": SANDBOX_UID,
                    "runAsGroup": SANDBOX_GID,
                    "allowPrivilegeEscalation": false,
                    "capabilities": { "drop": ["ALL"] },
                },
                "volumeMounts": [
                    { "name": "workspace", "mountPath": WORKSPACE_DIR },
                    { "name": "tmp", "mountPath": "/tmp" },
                ],
            }],
            "volumes": [
                {
                    "name": "workspace",
                    "emptyDir": { "medium": "Memory", "sizeLimit": format!("{}Mi", k8s.workspace_size_mb) },
                },
                {
                    "name": "tmp",
                    "emptyDir": { "medium": "Memory", "sizeLimit": format!("{TMP_SIZE_MB}Mi") },
                },
            ],
        },
    })
}

pub(crate) fn build_pod(
    k8s: &KubernetesConfig,
    name: &str,
    config: &EnvironmentConfig,
) -> Result<Pod, SandboxError> {
    serde_json::from_value(pod_manifest(k8s, name, config))
        .map_err(|e| SandboxError::Provisioning(format!("invalid pod manifest: {e}")))
}
