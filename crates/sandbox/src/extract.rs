//! Turns the post-run workspace tar stream into ordered result entries.

use std::io::Read;

use crate::error::{Result, SandboxError};
use crate::types::{Archive, WorkspaceEntry};

/// Strip the `./` prefix and trailing `/` that `tar -c -C dir .` produces.
fn normalise_member_name(raw: &str) -> &str {
    let mut name = raw;
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    name.trim_start_matches('/').trim_end_matches('/')
}

/// Parse a workspace archive into entries sorted by path.
///
/// Regular files carry their bytes and directories carry nothing. Paths in
/// `exclude` are skipped, as are the workspace root and any link or special
/// file, so nothing outside plain files and directories reaches the caller.
pub fn entries_from_archive(archive: &Archive, exclude: &[&str]) -> Result<Vec<WorkspaceEntry>> {
    let mut reader = tar::Archive::new(archive.as_bytes());
    let mut entries = Vec::new();
    let members = reader
        .entries()
        .map_err(|e| SandboxError::Extraction(format!("unreadable archive: {e}")))?;

    for member in members {
        let mut member =
            member.map_err(|e| SandboxError::Extraction(format!("corrupt archive entry: {e}")))?;
        let raw = String::from_utf8_lossy(&member.path_bytes()).into_owned();
        let path = normalise_member_name(&raw);
        if path.is_empty() || path == "." || exclude.contains(&path) {
            continue;
        }

        let kind = member.header().entry_type();
        if kind.is_dir() {
            entries.push(WorkspaceEntry::directory(path));
        } else if kind.is_file() {
            let mut content = Vec::new();
            member.read_to_end(&mut content).map_err(|e| {
                SandboxError::Extraction(format!("failed to read {path}: {e}"))
            })?;
            entries.push(WorkspaceEntry::file(path, content));
        } else {
            tracing::debug!(path, kind = ?kind, "skipping non-regular workspace entry");
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Copy `archive`, dropping members whose normalised path is in `exclude`.
///
/// Matching is exact, so excluding `__main__.py` leaves `sub/__main__.py` alone.
pub fn exclude_members(archive: &Archive, exclude: &[&str]) -> Result<Archive> {
    if exclude.is_empty() {
        return Ok(archive.clone());
    }
    let mut reader = tar::Archive::new(archive.as_bytes());
    let mut builder = tar::Builder::new(Vec::new());
    let members = reader
        .entries()
        .map_err(|e| SandboxError::Extraction(format!("unreadable archive: {e}")))?;

    for member in members {
        let mut member =
            member.map_err(|e| SandboxError::Extraction(format!("corrupt archive entry: {e}")))?;
        let raw = String::from_utf8_lossy(&member.path_bytes()).into_owned();
        if exclude.contains(&normalise_member_name(&raw)) {
            continue;
        }
        let mut header = member.header().clone();
        builder
            .append_data(&mut header, &raw, &mut member)
            .map_err(|e| SandboxError::Extraction(format!("failed to copy {raw}: {e}")))?;
    }

    let bytes = builder
        .into_inner()
        .map_err(|e| SandboxError::Extraction(format!("failed to finish archive: {e}")))?;
    Ok(Archive::from_bytes(bytes))
}
