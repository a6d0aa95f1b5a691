use std::path::PathBuf;

use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the classification service.
///
/// Request-scoped variants map onto HTTP responses. The model-loading
/// variants only occur at startup and abort the process.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("File must be an image")]
    NotAnImage,

    #[error("Invalid image file")]
    InvalidImage(#[source] image::ImageError),

    #[error("No file uploaded")]
    MissingFile,

    #[error("Malformed upload: {0}")]
    Upload(String),

    #[error("Upload exceeds the size limit")]
    UploadTooLarge,

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Model directory not found: {}", .0.display())]
    ModelDirNotFound(PathBuf),

    #[error("Failed to load model artifacts: {0}")]
    ModelLoad(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotAnImage | Self::InvalidImage(_) | Self::MissingFile | Self::Upload(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::UploadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Inference(_) | Self::ModelDirNotFound(_) | Self::ModelLoad(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// Message returned to the caller. Server-side details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            Self::Inference(_) => "Inference failed".to_string(),
            Self::ModelDirNotFound(_) | Self::ModelLoad(_) => "Model unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<MultipartError> for ServiceError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::UploadTooLarge
        } else {
            Self::Upload(err.body_text())
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.is_client_error() {
            tracing::warn!(error = %self, "Rejected request");
        } else {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "detail": self.public_message() }))).into_response()
    }
}

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;
