//! Error types for each ingestion concern
//!
//! Every enum converts into [`prodsync_common::SyncError`] so run-level callers can
//! handle one type.

use prodsync_common::SyncError;
use std::time::Duration;
use thiserror::Error;

/// Failure while pulling raw payloads from an upstream source
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Malformed payload from {source_name}: {reason}")]
    Payload { source_name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Page at offset {offset} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        offset: usize,
        attempts: u32,
        #[source]
        last_error: Box<FetchError>,
    },
}

impl FetchError {
    pub fn payload(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        FetchError::Payload {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

/// A whole payload could not be parsed.
///
/// Single malformed records are not errors; they land in
/// [`crate::parsers::ParseReport::rejections`].
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid XML at byte {position}: {reason}")]
    Xml { position: u64, reason: String },

    #[error("Failed to decompress payload: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("Expected {expected}, found {found}")]
    Shape { expected: &'static str, found: String },
}

/// Failure talking to the index sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Index returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Index rejected batch {batch_index}: {reason}")]
    Rejected { batch_index: usize, reason: String },

    #[error("Task {task_id} not completed after {waited:?}")]
    Timeout { task_id: u64, waited: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Missing or invalid startup configuration. Always fatal before any fetch begins.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

impl ConfigError {
    pub fn invalid(var: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var: var.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure persisting or reloading merge state
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

impl From<FetchError> for SyncError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Io(e) => SyncError::Io(e),
            other => SyncError::Network(other.to_string()),
        }
    }
}

impl From<ParseError> for SyncError {
    fn from(err: ParseError) -> Self {
        SyncError::Parse(err.to_string())
    }
}

impl From<SinkError> for SyncError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Timeout { .. } => SyncError::Timeout(err.to_string()),
            other => SyncError::Upload(other.to_string()),
        }
    }
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<SnapshotError> for SyncError {
    fn from(err: SnapshotError) -> Self {
        SyncError::Snapshot(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_lists_every_variable() {
        let err = ConfigError::Missing(vec!["INDEX_APP_ID".into(), "INDEX_API_KEY".into()]);
        assert_eq!(
            err.to_string(),
            "Missing required environment variables: INDEX_APP_ID, INDEX_API_KEY"
        );
    }

    #[test]
    fn test_sink_timeout_maps_to_timeout() {
        let err = SinkError::Timeout {
            task_id: 42,
            waited: Duration::from_secs(5),
        };
        assert!(matches!(SyncError::from(err), SyncError::Timeout(_)));

        let err = SinkError::Status {
            status: 500,
            body: "boom".into(),
        };
        assert!(matches!(SyncError::from(err), SyncError::Upload(_)));
    }

    #[test]
    fn test_retries_exhausted_keeps_last_error() {
        let err = FetchError::RetriesExhausted {
            offset: 2000,
            attempts: 4,
            last_error: Box::new(FetchError::Status {
                status: 503,
                url: "http://api/products".into(),
            }),
        };
        let message = err.to_string();
        assert!(message.contains("offset 2000"));
        assert!(message.contains("503"));
        assert!(SyncError::from(err).is_transient());
    }
}
