use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sandbox::SandboxError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("file with ID '{file_id}' not found for path '{path}'")]
    FileNotFound { file_id: uuid::Uuid, path: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Sandbox(SandboxError::Validation(_)) | Self::InvalidRequest(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Sandbox(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Sandbox(SandboxError::Infrastructure(_)) => StatusCode::BAD_GATEWAY,
            Self::FileNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Sandbox(_) | Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
