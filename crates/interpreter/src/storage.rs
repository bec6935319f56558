use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};

/// Looks up previously uploaded file content by id.
#[async_trait]
pub trait FileResolver: Send + Sync {
    /// Bytes stored under `file_id`. `path` is the workspace path the caller
    /// asked for and only appears in the not-found error.
    async fn resolve(&self, file_id: Uuid, path: &str) -> ServiceResult<Vec<u8>>;
}

/// Uploads kept as `<dir>/<uuid>` on the local filesystem.
pub struct LocalFileStore {
    dir: PathBuf,
}

impl LocalFileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl FileResolver for LocalFileStore {
    async fn resolve(&self, file_id: Uuid, path: &str) -> ServiceResult<Vec<u8>> {
        let location = self.dir.join(file_id.to_string());
        match tokio::fs::read(&location).await {
            Ok(content) => {
                debug!(file_id = %file_id, bytes = content.len(), "resolved stored file");
                Ok(content)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ServiceError::FileNotFound {
                file_id,
                path: path.to_owned(),
            }),
            Err(e) => Err(ServiceError::Io(e)),
        }
    }
}
