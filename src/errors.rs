use crate::services::storage::StorageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            StorageError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            StorageError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            StorageError::Backend { .. } | StorageError::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<FileError> for AppError {
    fn from(err: FileError) -> Self {
        let status = match &err {
            FileError::Validation(_) | FileError::Upload(_) => StatusCode::BAD_REQUEST,
            FileError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            FileError::NotFound(_) => StatusCode::NOT_FOUND,
            FileError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            FileError::Conflict(_) => StatusCode::CONFLICT,
            FileError::Storage(inner) => return AppError::from_storage_with(inner, &err),
            FileError::PartialBatchFailure { .. } => StatusCode::BAD_GATEWAY,
            FileError::Sqlx(_) | FileError::Io(_) | FileError::Zip(_) => {
                tracing::error!("internal failure: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl AppError {
    fn from_storage_with(inner: &StorageError, outer: &FileError) -> Self {
        let status = match inner {
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            StorageError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            StorageError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::BAD_GATEWAY,
        };
        AppError::new(status, outer.to_string())
    }
}

/// Why an upload never reached the service intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFailure {
    SizeLimit,
    PartialTransfer,
    MissingTempStorage,
    WriteFailure,
    Interrupted,
}

impl UploadFailure {
    pub fn message(self) -> &'static str {
        match self {
            Self::SizeLimit => "file exceeds the allowed upload size",
            Self::PartialTransfer => "file was only partially uploaded",
            Self::MissingTempStorage => "server is missing temporary upload storage",
            Self::WriteFailure => "server failed to write the upload to disk",
            Self::Interrupted => "upload was interrupted",
        }
    }
}

impl fmt::Display for UploadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Failures surfaced by the file management service.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("{0}")]
    Validation(String),
    #[error("customer storage quota exceeded: {current} bytes used + {incoming} incoming > {limit}")]
    QuotaExceeded {
        current: u64,
        incoming: u64,
        limit: u64,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Conflict(String),
    #[error("batch aborted after storing {} of {total} files: {source}", .stored.len())]
    PartialBatchFailure {
        /// Record ids persisted before the failure.
        stored: Vec<i64>,
        total: usize,
        source: Box<FileError>,
    },
    #[error("{0}")]
    Upload(UploadFailure),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

pub type FileResult<T> = Result<T, FileError>;
