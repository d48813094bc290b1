use std::path::PathBuf;
use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Magic or version did not match the current container format
    #[error("format error: {0}")]
    Format(String),

    /// AEAD tag verification failed (tampering or wrong key)
    #[error("authentication failed at frame {frame}: wrong key or corrupted data")]
    Authentication { frame: u64 },

    #[error("size mismatch: declared {declared} bytes, found {found}")]
    SizeMismatch { declared: u64, found: u64 },

    #[error("container truncated: declared {declared} bytes, recovered {recovered}")]
    Truncation { declared: u64, recovered: u64 },

    #[error("config error: {0}")]
    Config(String),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    /// True for failures caused by the container contents or key rather than storage.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            CryptoError::Format(_)
                | CryptoError::Authentication { .. }
                | CryptoError::SizeMismatch { .. }
                | CryptoError::Truncation { .. }
        )
    }
}
