use std::path::PathBuf;
use std::process::ExitStatus;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Reasons a render job ends FAILED. The display text becomes the
/// `message` field of the terminal event.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("a render job is already running (job {holder})")]
    Busy { holder: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no diffusion models found in {}", dir.display())]
    NoModels { dir: PathBuf },

    #[error("failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("render process exited with {status}, check the log")]
    ExitStatus { status: ExitStatus },

    #[error("render process finished but {} was not written", path.display())]
    MissingOutput { path: PathBuf },

    #[error("render stopped before the process started")]
    Stopped,

    #[error("render worker panicked")]
    Panicked,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    NotFound(String),
}

/// Errors from reading or writing PNG provenance chunks.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("png decode: {0}")]
    Decode(#[from] png::DecodingError),

    #[error("png encode: {0}")]
    Encode(#[from] png::EncodingError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image buffer size overflows")]
    BufferSize,
}

/// Application-level error type for HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => AppError::NotFound(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    msg.clone(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
