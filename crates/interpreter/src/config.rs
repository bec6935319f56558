use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, ValueEnum};
use sandbox::ResourceLimits;
use sandbox_docker::DockerConfig;
use sandbox_k8s::KubernetesConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

pub(crate) const DEFAULT_MAX_EXEC_TIMEOUT_MS: u64 = 60_000;
pub(crate) const DEFAULT_CPU_TIME_LIMIT_SEC: u32 = 5;
pub(crate) const DEFAULT_MEMORY_LIMIT_MB: u32 = 256;
pub(crate) const DEFAULT_MAX_OUTPUT_BYTES: usize = 1_000_000;
pub(crate) const DEFAULT_PROCESS_LIMIT: u32 = 64;
pub(crate) const DEFAULT_WORKSPACE_SIZE_MB: u32 = 100;
pub(crate) const DEFAULT_PROVISION_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_IMAGE: &str = "onyxdotapp/python-executor-sci";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Docker,
    #[serde(alias = "k8s")]
    #[value(alias = "k8s")]
    Kubernetes,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub backend: Backend,
    pub host: String,
    pub port: u16,
    /// Directory holding uploaded files as `<uuid>`.
    pub file_storage_dir: PathBuf,
    pub limits: LimitsConfig,
    pub docker: DockerSection,
    pub kubernetes: KubernetesSection,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Docker,
            host: "0.0.0.0".into(),
            port: 8000,
            file_storage_dir: PathBuf::from("/tmp/code-interpreter-files"),
            limits: LimitsConfig::default(),
            docker: DockerSection::default(),
            kubernetes: KubernetesSection::default(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest `timeout_ms` a request may ask for.
    pub max_exec_timeout_ms: u64,
    pub cpu_time_limit_sec: u32,
    pub memory_limit_mb: u32,
    pub max_output_bytes: usize,
    pub process_limit: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_exec_timeout_ms: DEFAULT_MAX_EXEC_TIMEOUT_MS,
            cpu_time_limit_sec: DEFAULT_CPU_TIME_LIMIT_SEC,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            process_limit: DEFAULT_PROCESS_LIMIT,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSection {
    pub binary: String,
    pub image: String,
    pub run_args: Vec<String>,
    pub workspace_size_mb: u32,
    pub provision_timeout_secs: u64,
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            binary: "docker".into(),
            image: DEFAULT_IMAGE.into(),
            run_args: Vec::new(),
            workspace_size_mb: DEFAULT_WORKSPACE_SIZE_MB,
            provision_timeout_secs: DEFAULT_PROVISION_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesSection {
    pub namespace: String,
    pub image: String,
    pub service_account: Option<String>,
    pub workspace_size_mb: u32,
    pub provision_timeout_secs: u64,
}

impl Default for KubernetesSection {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            image: DEFAULT_IMAGE.into(),
            service_account: None,
            workspace_size_mb: DEFAULT_WORKSPACE_SIZE_MB,
            provision_timeout_secs: DEFAULT_PROVISION_TIMEOUT_SECS,
        }
    }
}

/// Command-line and environment overrides, applied on top of the YAML file.
#[derive(Debug, Default, Args)]
pub struct ConfigArgs {
    /// Path to a YAML config file
    #[arg(long, short, env = "CODE_INTERPRETER_CONFIG")]
    pub config: Option<PathBuf>,
    /// Executor backend
    #[arg(long, env = "EXECUTOR_BACKEND", value_enum)]
    pub backend: Option<Backend>,
    #[arg(long, env = "MAX_EXEC_TIMEOUT_MS")]
    pub max_exec_timeout_ms: Option<u64>,
    #[arg(long, env = "CPU_TIME_LIMIT_SEC")]
    pub cpu_time_limit_sec: Option<u32>,
    #[arg(long, env = "MEMORY_LIMIT_MB")]
    pub memory_limit_mb: Option<u32>,
    #[arg(long, env = "MAX_OUTPUT_BYTES")]
    pub max_output_bytes: Option<usize>,
    #[arg(long, env = "PROCESS_LIMIT")]
    pub process_limit: Option<u32>,
    #[arg(long, env = "FILE_STORAGE_DIR")]
    pub file_storage_dir: Option<PathBuf>,
    #[arg(long, env = "PYTHON_EXECUTOR_DOCKER_BIN")]
    pub docker_bin: Option<String>,
    #[arg(long, env = "PYTHON_EXECUTOR_DOCKER_IMAGE")]
    pub docker_image: Option<String>,
    /// Extra `docker run` arguments, split shell-style
    #[arg(long, env = "PYTHON_EXECUTOR_DOCKER_RUN_ARGS", allow_hyphen_values = true)]
    pub docker_run_args: Option<String>,
    #[arg(long, env = "KUBERNETES_EXECUTOR_NAMESPACE")]
    pub kubernetes_namespace: Option<String>,
    #[arg(long, env = "KUBERNETES_EXECUTOR_IMAGE")]
    pub kubernetes_image: Option<String>,
    #[arg(long, env = "KUBERNETES_EXECUTOR_SERVICE_ACCOUNT")]
    pub kubernetes_service_account: Option<String>,
    #[arg(long, env = "HOST")]
    pub host: Option<String>,
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
}

/// Build the service config: YAML file if given, then overrides, then validation.
///
/// Relative paths in the file are resolved against the file's parent directory.
pub async fn load(args: ConfigArgs) -> ServiceResult<ServiceConfig> {
    let mut config = match &args.config {
        Some(path) => read_file(path).await?,
        None => ServiceConfig::default(),
    };
    config.apply(args)?;
    config.validate()?;
    Ok(config)
}

async fn read_file(path: &Path) -> ServiceResult<ServiceConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ServiceError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: ServiceConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| ServiceError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    Ok(config)
}

fn ensure_positive(value: u64, label: &str) -> ServiceResult<()> {
    if value == 0 {
        return Err(ServiceError::Config(format!("{label} must be greater than 0")));
    }
    Ok(())
}

fn ensure_present(value: &str, label: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::Config(format!("{label} must not be empty")));
    }
    Ok(())
}

impl ServiceConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if self.file_storage_dir.is_relative() {
            self.file_storage_dir = config_dir.join(&self.file_storage_dir);
        }
    }

    fn apply(&mut self, args: ConfigArgs) -> ServiceResult<()> {
        if let Some(backend) = args.backend {
            self.backend = backend;
        }
        if let Some(v) = args.max_exec_timeout_ms {
            self.limits.max_exec_timeout_ms = v;
        }
        if let Some(v) = args.cpu_time_limit_sec {
            self.limits.cpu_time_limit_sec = v;
        }
        if let Some(v) = args.memory_limit_mb {
            self.limits.memory_limit_mb = v;
        }
        if let Some(v) = args.max_output_bytes {
            self.limits.max_output_bytes = v;
        }
        if let Some(v) = args.process_limit {
            self.limits.process_limit = v;
        }
        if let Some(dir) = args.file_storage_dir {
            self.file_storage_dir = dir;
        }
        if let Some(binary) = args.docker_bin {
            self.docker.binary = binary;
        }
        if let Some(image) = args.docker_image {
            self.docker.image = image;
        }
        if let Some(raw) = args.docker_run_args {
            self.docker.run_args = shlex::split(&raw).ok_or_else(|| {
                ServiceError::Config(format!("unbalanced quoting in docker run args: {raw}"))
            })?;
        }
        if let Some(namespace) = args.kubernetes_namespace {
            self.kubernetes.namespace = namespace;
        }
        if let Some(image) = args.kubernetes_image {
            self.kubernetes.image = image;
        }
        if let Some(account) = args.kubernetes_service_account {
            self.kubernetes.service_account = Some(account);
        }
        if let Some(host) = args.host {
            self.host = host;
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        // An empty account means "none", as with an unset variable.
        self.kubernetes.service_account = self
            .kubernetes
            .service_account
            .take()
            .filter(|account| !account.trim().is_empty());
        Ok(())
    }

    fn validate(&self) -> ServiceResult<()> {
        let limits = &self.limits;
        ensure_positive(limits.max_exec_timeout_ms, "max_exec_timeout_ms")?;
        ensure_positive(limits.cpu_time_limit_sec.into(), "cpu_time_limit_sec")?;
        ensure_positive(limits.memory_limit_mb.into(), "memory_limit_mb")?;
        ensure_positive(limits.max_output_bytes as u64, "max_output_bytes")?;
        ensure_positive(limits.process_limit.into(), "process_limit")?;
        ensure_present(&self.host, "host")?;
        match self.backend {
            Backend::Docker => {
                ensure_present(&self.docker.binary, "docker binary")?;
                ensure_present(&self.docker.image, "docker image")?;
                ensure_positive(self.docker.workspace_size_mb.into(), "docker workspace_size_mb")?;
                ensure_positive(self.docker.provision_timeout_secs, "docker provision_timeout_secs")?;
            }
            Backend::Kubernetes => {
                ensure_present(&self.kubernetes.namespace, "kubernetes namespace")?;
                ensure_present(&self.kubernetes.image, "kubernetes image")?;
                ensure_positive(
                    self.kubernetes.workspace_size_mb.into(),
                    "kubernetes workspace_size_mb",
                )?;
                ensure_positive(
                    self.kubernetes.provision_timeout_secs,
                    "kubernetes provision_timeout_secs",
                )?;
            }
        }
        Ok(())
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_mb: self.limits.memory_limit_mb,
            cpu_time_secs: self.limits.cpu_time_limit_sec,
            max_processes: self.limits.process_limit,
            max_output_bytes: self.limits.max_output_bytes,
        }
    }

    pub fn max_exec_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.max_exec_timeout_ms)
    }

    /// How long the selected backend may take to make an environment ready.
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(match self.backend {
            Backend::Docker => self.docker.provision_timeout_secs,
            Backend::Kubernetes => self.kubernetes.provision_timeout_secs,
        })
    }

    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            binary: self.docker.binary.clone(),
            image: self.docker.image.clone(),
            extra_run_args: self.docker.run_args.clone(),
            workspace_size_mb: self.docker.workspace_size_mb,
            provision_timeout: Duration::from_secs(self.docker.provision_timeout_secs),
        }
    }

    pub fn kubernetes_config(&self) -> KubernetesConfig {
        KubernetesConfig {
            namespace: self.kubernetes.namespace.clone(),
            image: self.kubernetes.image.clone(),
            service_account: self.kubernetes.service_account.clone(),
            workspace_size_mb: self.kubernetes.workspace_size_mb,
            provision_timeout: Duration::from_secs(self.kubernetes.provision_timeout_secs),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
