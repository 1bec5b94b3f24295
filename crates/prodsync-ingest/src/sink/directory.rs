//! JSON-lines directory sink
//!
//! Writes each batch to `<dir>/<prefix>-<batch>.jsonl`. A write is durable once the
//! file is on disk, so completion is immediate.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{Batch, IndexSink, TaskHandle};
use crate::error::SinkError;

#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
    prefix: String,
}

impl DirectorySink {
    /// `prefix` distinguishes runs sharing one directory, e.g. the run id
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn batch_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}-{:05}.jsonl", self.prefix, index))
    }
}

#[async_trait]
impl IndexSink for DirectorySink {
    async fn submit(&self, batch: Batch<'_>) -> Result<TaskHandle, SinkError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.batch_path(batch.index);
        let records = batch.records.to_vec();
        let target = path.clone();
        tokio::task::spawn_blocking(move || serde_jsonlines::write_json_lines(&target, &records))
            .await
            .map_err(|e| SinkError::Io(std::io::Error::other(e)))??;

        info!(path = %path.display(), records = batch.len(), "Wrote batch file");
        Ok(TaskHandle {
            batch_index: batch.index,
            task_id: batch.index as u64,
        })
    }

    async fn await_completion(&self, _handle: &TaskHandle) -> Result<(), SinkError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "directory"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use prodsync_common::WireRecord;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_batches_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("batches"), "run");
        let records: Vec<WireRecord> = (0..3)
            .map(|i| json!({ "id": i.to_string(), "name": "x" }).as_object().cloned().unwrap())
            .collect();

        let handle = sink
            .submit(Batch {
                index: 1,
                records: &records,
            })
            .await
            .unwrap();
        sink.await_completion(&handle).await.unwrap();

        let path = sink.batch_path(1);
        assert!(path.ends_with("run-00001.jsonl"));
        let lines: Vec<Value> = serde_jsonlines::json_lines(&path)
            .unwrap()
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2]["id"], "2");
    }
}
