//! Application error taxonomy and HTTP error-body mapping.
//!
//! Every failure surfaced by the engine maps to one stable `kind` string so
//! the proxy layer in front of this service can branch without parsing
//! messages.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Error model used throughout probing, conversion, inference, and the job API.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Byte signature did not match any supported audio or video container.
    #[error("{0}")]
    UnsupportedFormat(String),
    /// The transcoder subprocess exited non-zero or produced unusable output.
    #[error("{0}")]
    ConversionFailed(String),
    /// The transcoder subprocess exceeded its deadline and was killed.
    #[error("{0}")]
    ConversionTimeout(String),
    /// Model weights could not be fetched or loaded.
    #[error("{0}")]
    ModelLoad(String),
    /// The model call itself failed.
    #[error("{0}")]
    Inference(String),
    /// Job id is unknown, malformed-but-valid-looking, or already swept.
    #[error("unknown or expired job id {0}")]
    JobNotFound(String),
    /// The configured queue limit is reached; the request was not enqueued.
    #[error("{0}")]
    QueueSaturated(String),
    /// Upload exceeds the configured size ceiling.
    #[error("{0}")]
    FileTooLarge(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    BadMultipart(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::UnsupportedFormat(message.into())
    }

    pub fn conversion_failed(message: impl Into<String>) -> Self {
        Self::ConversionFailed(message.into())
    }

    pub fn conversion_timeout(message: impl Into<String>) -> Self {
        Self::ConversionTimeout(message.into())
    }

    pub fn model_load(message: impl Into<String>) -> Self {
        Self::ModelLoad(message.into())
    }

    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference(message.into())
    }

    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::JobNotFound(job_id.into())
    }

    pub fn queue_saturated(message: impl Into<String>) -> Self {
        Self::QueueSaturated(message.into())
    }

    pub fn file_too_large(message: impl Into<String>) -> Self {
        Self::FileTooLarge(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Creates a multipart parsing/shape validation error.
    pub fn bad_multipart(message: impl Into<String>) -> Self {
        Self::BadMultipart(message.into())
    }

    /// Creates a generic internal server error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::ConversionFailed(_) => "conversion_failed",
            Self::ConversionTimeout(_) => "conversion_timeout",
            Self::ModelLoad(_) => "model_load_error",
            Self::Inference(_) => "inference_error",
            Self::JobNotFound(_) => "job_not_found",
            Self::QueueSaturated(_) => "queue_saturated",
            Self::FileTooLarge(_) => "file_too_large",
            Self::InvalidRequest(_) => "invalid_request",
            Self::BadMultipart(_) => "invalid_multipart",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::ConversionFailed(_) => StatusCode::BAD_REQUEST,
            Self::ConversionTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ModelLoad(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::JobNotFound(_) => StatusCode::NOT_FOUND,
            Self::QueueSaturated(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::FileTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::BadMultipart(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let payload = ErrorPayload {
            error: ErrorDetail {
                kind: self.kind(),
                message: self.to_string(),
            },
        };
        (status, Json(payload)).into_response()
    }
}
