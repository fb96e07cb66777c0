//! Error types and handling
//!
//! Common error types used across the application.

use crate::config::ConfigError;
use crate::drafts::StorageError;
use crate::media::MediaError;
use crate::processing::ProcessingError;
use crate::publish::PublishError;
use crate::recorder::RecordingError;
use crate::upload::UploadError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("Draft not found: {0}")]
    DraftNotFound(String),
}

impl AppError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Recording(_) => "RECORDING_ERROR",
            AppError::Media(_) => "MEDIA_ERROR",
            AppError::Processing(ProcessingError::MissingOriginal { .. }) => "INVARIANT_VIOLATION",
            AppError::Processing(ProcessingError::AlreadyPublished { .. }) => "ALREADY_PUBLISHED",
            AppError::Processing(ProcessingError::PublishInProgress { .. }) => "PUBLISH_IN_PROGRESS",
            AppError::Processing(_) => "PROCESSING_ERROR",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Upload(UploadError::Auth(_)) => "AUTH_REQUIRED",
            AppError::Upload(_) => "UPLOAD_ERROR",
            AppError::Publish(PublishError::Upload(UploadError::Auth(_))) => "AUTH_REQUIRED",
            AppError::Publish(_) => "PUBLISH_ERROR",
            AppError::DraftNotFound(_) => "DRAFT_NOT_FOUND",
        }
    }
}

/// Error response for a UI shell
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
