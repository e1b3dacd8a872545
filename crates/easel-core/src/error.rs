// Easel core error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EaselError {
    #[error("banned prompt: {0}")]
    BannedPrompt(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("upstream rejected: {0}")]
    UpstreamRejected(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(#[from] easel_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EaselError>;
