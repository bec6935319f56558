use std::time::Duration;

use tokio::sync::mpsc;

pub struct RunRequest<'a> {
    pub stdin: Option<&'a [u8]>,
    /// Wall-clock ceiling enforced by the caller, independent of the CPU-time rlimit.
    pub timeout: Duration,
    /// Receives output as it is captured, already truncated.
    pub output: Option<OutputSender>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Bytes the entrypoint wrote to one stream, forwarded while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

pub type OutputSender = mpsc::UnboundedSender<OutputChunk>;

/// Captured result of running the entrypoint. Streams are already truncated.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Exit code reported for an entrypoint killed by the wall-clock timer (128 + SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceEntry {
    /// Relative, `/`-separated, no leading `./`.
    pub path: String,
    pub kind: EntryKind,
    /// File bytes. Always `None` for directories.
    pub content: Option<Vec<u8>>,
}

impl WorkspaceEntry {
    pub fn file(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            content: Some(content),
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            content: None,
        }
    }
}

/// A tar stream moved into or out of an environment's workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive(Vec<u8>);

impl Archive {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
