//! Error types for modelfetch core

use thiserror::Error;

/// Errors that can occur in the download subsystem
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("No resume data available")]
    NoResumeData,

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Failed to encode cache info: {0}")]
    Encoding(String),

    #[error("Failed to decode cache info: {0}")]
    Decoding(String),

    #[error("Network error: {0}")]
    Transfer(#[from] reqwest::Error),

    #[error("Server error: status {0}")]
    ServerStatus(u16),

    #[error("A transfer is already in flight")]
    TransferInFlight,
}

impl FetchError {
    /// Decode failures mean the cached record should be treated as absent,
    /// not that the transfer itself failed.
    pub fn is_stale_cache(&self) -> bool {
        matches!(self, FetchError::Decoding(_))
    }
}
