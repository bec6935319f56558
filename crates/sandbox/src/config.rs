use std::time::Duration;

/// Smallest memory ceiling an environment is created with, in MiB.
pub const MIN_MEMORY_MB: u32 = 16;
/// Smallest CPU-time ceiling an environment is created with, in seconds.
pub const MIN_CPU_TIME_SECS: u32 = 1;

/// Per-environment ceilings. Supplied by service configuration, never by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    /// Consumed CPU seconds before the interpreter is killed. Independent of wall-clock time.
    pub cpu_time_secs: u32,
    pub max_processes: u32,
    /// Bytes retained per output stream before truncation.
    pub max_output_bytes: usize,
}

impl ResourceLimits {
    /// Memory ceiling clamped to [`MIN_MEMORY_MB`].
    pub fn effective_memory_mb(&self) -> u32 {
        self.memory_mb.max(MIN_MEMORY_MB)
    }

    /// CPU-time ceiling clamped to [`MIN_CPU_TIME_SECS`].
    pub fn effective_cpu_time_secs(&self) -> u32 {
        self.cpu_time_secs.max(MIN_CPU_TIME_SECS)
    }
}

pub struct EnvironmentConfig {
    pub id: uuid::Uuid,
    pub resources: ResourceLimits,
    /// Upper bound on how long the environment may exist at all. Backends bake
    /// this into the environment so it expires even if in-band destroy never runs.
    pub lifetime: Duration,
}
