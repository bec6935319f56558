//! Fixed layout shared by every backend's environment image.

/// Workspace root inside the environment.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Reserved workspace file holding the (possibly transformed) user code.
pub const ENTRYPOINT: &str = "__main__.py";

/// Unprivileged identity user code runs as.
pub const SANDBOX_UID: u32 = 65532;
pub const SANDBOX_GID: u32 = 65532;

pub const INTERPRETER: &str = "python";

/// Size of the scratch `/tmp` mount, in MiB.
pub const TMP_SIZE_MB: u32 = 64;

/// Environment variables set for the interpreter in every backend.
pub const INTERPRETER_ENV: [(&str, &str); 4] = [
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("PYTHONIOENCODING", "utf-8"),
    ("MPLCONFIGDIR", "/tmp/matplotlib"),
];

/// Label attached to every environment so leftovers can be found and swept.
pub const MANAGED_LABEL_KEY: &str = "code-interpreter.managed";
pub const MANAGED_LABEL_VALUE: &str = "true";

/// Absolute path of the entrypoint inside the environment.
pub fn entrypoint_path() -> String {
    format!("{WORKSPACE_DIR}/{ENTRYPOINT}")
}

/// `uid:gid` form accepted by container runtimes.
pub fn user_spec() -> String {
    format!("{SANDBOX_UID}:{SANDBOX_GID}")
}

/// Shell snippet that SIGKILLs every process the calling identity may signal,
/// except itself and PID 1 (the dormant keep-alive process).
pub const KILL_ALL_SCRIPT: &str = "kill -9 -1";
