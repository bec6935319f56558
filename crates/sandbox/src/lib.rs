mod config;
mod environment;
mod error;
mod executor;
mod extract;
mod guard;
pub mod layout;
mod lifecycle;
mod output;
mod payload;
mod transform;
mod types;

pub use config::{EnvironmentConfig, MIN_CPU_TIME_SECS, MIN_MEMORY_MB, ResourceLimits};
pub use environment::Environment;
pub use error::{Result, SandboxError};
pub use executor::Executor;
pub use extract::{entries_from_archive, exclude_members};
pub use guard::{EnvironmentGuard, ProvisionGuard};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use output::{OutputCollector, TRUNCATION_MARKER};
pub use payload::{StagedFile, stage, validate_relative_path};
pub use transform::transform;
pub use types::{
    Archive, EntryKind, KILLED_EXIT_CODE, OutputChunk, OutputSender, OutputStream, RawOutput,
    RunRequest, WorkspaceEntry,
};
