//! Builds the tar stream that seeds an environment's workspace.

use std::collections::{BTreeSet, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use tar::{Builder, EntryType, Header};

use crate::error::{Result, SandboxError};
use crate::layout::{ENTRYPOINT, SANDBOX_GID, SANDBOX_UID};
use crate::types::Archive;

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

/// A user file to place in the workspace, content already resolved.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub path: String,
    pub content: Vec<u8>,
}

impl StagedFile {
    pub fn new(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content,
        }
    }
}

/// Check a user-supplied workspace path and return its normalised form.
///
/// Empty and `.` segments are dropped, so `a//./b` becomes `a/b`. Absolute
/// paths, `..` segments, NUL bytes, paths that normalise to nothing and the
/// reserved entrypoint name are rejected.
pub fn validate_relative_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(SandboxError::Validation("file path must not be empty".into()));
    }
    if path.contains('\0') {
        return Err(SandboxError::Validation(format!(
            "file path contains a NUL byte: {path:?}"
        )));
    }
    if path.starts_with('/') {
        return Err(SandboxError::Validation(format!(
            "file path must be relative: {path}"
        )));
    }

    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    if segments.contains(&"..") {
        return Err(SandboxError::Validation(format!(
            "file path must not contain '..': {path}"
        )));
    }
    if segments.is_empty() {
        return Err(SandboxError::Validation(format!(
            "file path has no components: {path:?}"
        )));
    }
    if segments.first() == Some(&ENTRYPOINT) {
        return Err(SandboxError::Validation(format!(
            "file path collides with reserved {ENTRYPOINT}: {path}"
        )));
    }
    Ok(segments.join("/"))
}

/// Every proper ancestor of `path`, shortest first (`a/b/c` -> `a`, `a/b`).
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').filter_map(|(idx, _)| path.get(..idx))
}

/// Assemble the entrypoint and `files` into a single archive.
///
/// All files are validated before anything is written, so a request with one
/// bad path produces no archive at all. Intermediate directories are
/// synthesised, and every entry is owned by the sandbox identity.
pub fn stage(entrypoint_code: &str, files: &[StagedFile]) -> Result<Archive> {
    let mut normalised = Vec::with_capacity(files.len());
    let mut seen = HashSet::with_capacity(files.len());
    let mut directories = BTreeSet::new();
    for file in files {
        let path = validate_relative_path(&file.path)?;
        if !seen.insert(path.clone()) {
            return Err(SandboxError::Validation(format!(
                "duplicate file path: {path}"
            )));
        }
        directories.extend(ancestors(&path).map(str::to_owned));
        normalised.push((path, file.content.as_slice()));
    }
    if let Some(clash) = directories.iter().find(|dir| seen.contains(*dir)) {
        return Err(SandboxError::Validation(format!(
            "path is used as both a file and a directory: {clash}"
        )));
    }

    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let mut builder = Builder::new(Vec::new());

    for dir in &directories {
        let mut header = entry_header(EntryType::Directory, DIR_MODE, 0, mtime);
        builder.append_data(&mut header, format!("{dir}/"), std::io::empty())?;
    }

    let entrypoint = entrypoint_code.as_bytes();
    let mut header = entry_header(EntryType::Regular, FILE_MODE, entrypoint.len(), mtime);
    builder.append_data(&mut header, ENTRYPOINT, entrypoint)?;

    for (path, content) in normalised {
        let mut header = entry_header(EntryType::Regular, FILE_MODE, content.len(), mtime);
        builder.append_data(&mut header, &path, content)?;
    }

    let bytes = builder.into_inner()?;
    tracing::debug!(
        files = files.len(),
        directories = directories.len(),
        bytes = bytes.len(),
        "payload staged"
    );
    Ok(Archive::from_bytes(bytes))
}

fn entry_header(kind: EntryType, mode: u32, size: usize, mtime: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_size(size as u64);
    header.set_uid(u64::from(SANDBOX_UID));
    header.set_gid(u64::from(SANDBOX_GID));
    header.set_mtime(mtime);
    header
}
