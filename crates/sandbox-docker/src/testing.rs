//! Stand-in container CLI for exercising the backend without a daemon.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// A shell script installed as the container CLI. Every invocation appends its
/// arguments to `calls.log`; `body` is a `case "$*"` arm list deciding the rest.
pub(crate) struct FakeDocker {
    dir: tempfile::TempDir,
}

impl FakeDocker {
    pub(crate) fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let script = format!(
            "#!/bin/sh\necho \"$*\" >> '{}'\ncase \"$*\" in\n{body}\nesac\nexit 0\n",
            log.display()
        );
        let path = dir.path().join("docker");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    pub(crate) fn binary(&self) -> String {
        self.path().display().to_string()
    }

    fn path(&self) -> PathBuf {
        self.dir.path().join("docker")
    }

    fn log(&self) -> PathBuf {
        self.dir.path().join("calls.log")
    }

    /// Invocations whose first argument is `subcommand`.
    pub(crate) fn calls(&self, subcommand: &str) -> usize {
        read(&self.log())
            .lines()
            .filter(|line| line.split_whitespace().next() == Some(subcommand))
            .count()
    }

    /// Invocations whose full argument list contains `needle`.
    pub(crate) fn calls_containing(&self, needle: &str) -> usize {
        read(&self.log()).lines().filter(|line| line.contains(needle)).count()
    }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}
