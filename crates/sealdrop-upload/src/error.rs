use sealdrop_crypto::CryptoError;
use thiserror::Error;

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),

    #[error("invalid chunk count {0}")]
    InvalidChunkCount(u32),

    /// Finalize attempted before every index in `[0, total)` arrived
    #[error("upload incomplete: {} of {total} chunks missing", missing.len())]
    IncompleteUpload { total: u32, missing: Vec<u32> },

    /// Finalize `total` disagrees with the chunks the session staged
    #[error("finalize total {got} differs from the session's {declared} chunks")]
    TotalMismatch { declared: u32, got: u32 },

    #[error("content hash mismatch: expected {expected}, got {actual}")]
    ContentHashMismatch { expected: String, actual: String },

    #[error("session {0} already finalized")]
    AlreadyFinalized(String),

    #[error("session {0} expired")]
    Expired(String),

    #[error("finalize cancelled")]
    Cancelled,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UploadError {
    /// Conditions the client resolves by continuing to upload.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::IncompleteUpload { .. })
    }
}
