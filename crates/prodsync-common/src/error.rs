//! Error types shared across prodsync crates

use thiserror::Error;

/// Result type alias for prodsync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Workspace-wide error type
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown source rank: {0}")]
    InvalidRank(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl SyncError {
    /// Whether re-running the same operation could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout(_) | SyncError::Io(_))
    }
}
