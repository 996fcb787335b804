use thiserror::Error;

use crate::vibecheck::media_upload::UploadError;
use crate::vibecheck::snapshot_source::SourceError;

pub type Result<T> = core::result::Result<T, VibeCheckError>;

#[derive(Error, Debug)]
pub enum VibeCheckError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Logging setup error: {0}")]
    LoggingSetup(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Place not found: {0}")]
    PlaceNotFound(String),

    #[error("Media uploader not configured")]
    UploaderNotConfigured,

    #[error("Realtime source error: {0}")]
    Source(#[from] SourceError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}
