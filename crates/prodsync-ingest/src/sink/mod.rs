//! Index sinks
//!
//! The search index is an external collaborator. It accepts a batch and hands back a
//! completion handle; awaiting the handle blocks until the batch is durably indexed.
//! No transactionality across batches is assumed.

pub mod directory;
pub mod http;
pub mod memory;

use async_trait::async_trait;
use prodsync_common::WireRecord;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{IngestConfig, SinkKind};
use crate::error::{ConfigError, SinkError};

pub use directory::DirectorySink;
pub use http::{HttpIndexSink, HttpSinkConfig};
pub use memory::MemorySink;

/// A contiguous slice of canonical records, identified by its position in the upload
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    pub index: usize,
    pub records: &'a [WireRecord],
}

impl Batch<'_> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Completion handle for a submitted batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    pub batch_index: usize,
    pub task_id: u64,
}

#[async_trait]
pub trait IndexSink: Send + Sync {
    /// Submit one batch for indexing
    async fn submit(&self, batch: Batch<'_>) -> Result<TaskHandle, SinkError>;

    /// Wait until the batch behind `handle` is durably indexed
    async fn await_completion(&self, handle: &TaskHandle) -> Result<(), SinkError>;

    fn name(&self) -> &str;
}

/// Build the sink selected by configuration.
///
/// `prefix` names directory-sink batch files so that runs sharing a directory do not
/// overwrite each other.
pub fn from_config(
    config: &IngestConfig,
    client: &reqwest::Client,
    prefix: &str,
) -> Result<Arc<dyn IndexSink>, ConfigError> {
    match config.sink {
        SinkKind::Http => {
            let index = config.index.as_ref().ok_or_else(|| {
                ConfigError::Missing(vec!["INDEX_APP_ID".to_string(), "INDEX_API_KEY".to_string()])
            })?;
            Ok(Arc::new(HttpIndexSink::new(
                client.clone(),
                HttpSinkConfig {
                    base_url: index.base_url.clone(),
                    index_name: index.index_name.clone(),
                    app_id: index.app_id.clone(),
                    api_key: index.api_key.clone(),
                    poll_interval: http::DEFAULT_POLL_INTERVAL,
                    retry: config.retry_policy(),
                },
            )))
        },
        SinkKind::Directory => Ok(Arc::new(DirectorySink::new(&config.sink_dir, prefix))),
    }
}
