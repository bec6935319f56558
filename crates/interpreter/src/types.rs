use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_timeout_ms() -> u64 {
    2000
}

fn default_interactive() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_interactive")]
    pub last_line_interactive: bool,
    #[serde(default)]
    pub files: Vec<FileRef>,
}

/// A workspace file named by the caller. Exactly one of `content` and
/// `file_id` is set.
#[derive(Debug, Deserialize)]
pub struct FileRef {
    pub path: String,
    #[serde(default, deserialize_with = "base64_opt::deserialize")]
    pub content: Option<Vec<u8>>,
    #[serde(default)]
    pub file_id: Option<Uuid>,
}

/// Where a [`FileRef`]'s bytes come from.
pub enum FileSource<'a> {
    Inline(&'a [u8]),
    Stored(Uuid),
}

impl FileRef {
    pub fn source(&self) -> Result<FileSource<'_>, String> {
        match (&self.content, self.file_id) {
            (Some(content), None) => Ok(FileSource::Inline(content)),
            (None, Some(file_id)) => Ok(FileSource::Stored(file_id)),
            (Some(_), Some(_)) => Err(format!(
                "file '{}' sets both content and file_id",
                self.path
            )),
            (None, None) => Err(format!(
                "file '{}' needs either content or file_id",
                self.path
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub files: Vec<WorkspaceFile>,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceFile {
    pub path: String,
    pub kind: FileKind,
    #[serde(with = "base64_opt")]
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

impl From<sandbox::EntryKind> for FileKind {
    fn from(kind: sandbox::EntryKind) -> Self {
        match kind {
            sandbox::EntryKind::File => Self::File,
            sandbox::EntryKind::Directory => Self::Directory,
        }
    }
}

impl From<sandbox::WorkspaceEntry> for WorkspaceFile {
    fn from(entry: sandbox::WorkspaceEntry) -> Self {
        Self {
            path: entry.path,
            kind: entry.kind.into(),
            content: entry.content,
        }
    }
}

/// Optional byte fields travel as standard base64 strings or `null`.
mod base64_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|text| STANDARD.decode(text.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
