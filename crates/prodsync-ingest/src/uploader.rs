//! Batch uploader
//!
//! Splits canonical records into contiguous batches of at most `max_batch_size`,
//! submits them in order, and waits for completion of the final batch only. Earlier
//! batches rely on the index applying same-key upserts in submission order.
//!
//! A failed submission, or a failed or timed-out final completion, fails the whole
//! upload with the partial [`UploadReport`] attached. Retrying is up to the caller.

use prodsync_common::WireRecord;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::error::SinkError;
use crate::sink::{Batch, IndexSink};
use crate::stats::RunStatistics;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 10_000;

pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(300);

/// What an upload got through
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Sizes of the batches the sink accepted, in order
    pub batch_sizes: Vec<usize>,
    /// Records in accepted batches; the final batch counts only once it completed
    pub records_uploaded: usize,
    /// Index of the batch whose completion was awaited
    pub awaited_batch: Option<usize>,
    pub completed: bool,
}

impl UploadReport {
    pub fn batches_submitted(&self) -> usize {
        self.batch_sizes.len()
    }

    pub fn statistics(&self) -> RunStatistics {
        RunStatistics {
            batches_submitted: self.batch_sizes.len() as u64,
            batches_completed: u64::from(self.completed),
            records_uploaded: self.records_uploaded as u64,
            ..Default::default()
        }
    }
}

/// An upload that stopped part-way
#[derive(Error, Debug)]
#[error(
    "Upload failed after {} records in {} batches: {source}",
    .report.records_uploaded,
    .report.batch_sizes.len()
)]
pub struct UploadFailure {
    pub report: UploadReport,
    #[source]
    pub source: SinkError,
}

impl UploadFailure {
    pub fn statistics(&self) -> RunStatistics {
        let mut stats = self.report.statistics();
        stats.upload_failures = 1;
        stats
    }
}

/// Contiguous batches over `records`; boundaries depend only on order and size
pub fn partition(records: &[WireRecord], max_batch_size: usize) -> impl Iterator<Item = Batch<'_>> {
    records
        .chunks(max_batch_size.max(1))
        .enumerate()
        .map(|(index, records)| Batch { index, records })
}

#[derive(Clone)]
pub struct BatchUploader {
    sink: Arc<dyn IndexSink>,
    max_batch_size: usize,
    completion_timeout: Duration,
}

impl BatchUploader {
    pub fn new(sink: Arc<dyn IndexSink>) -> Self {
        Self {
            sink,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub async fn upload(&self, records: &[WireRecord]) -> Result<UploadReport, UploadFailure> {
        let mut report = UploadReport::default();
        if records.is_empty() {
            info!(sink = self.sink.name(), "Nothing to upload");
            report.completed = true;
            return Ok(report);
        }

        let batch_count = records.len().div_ceil(self.max_batch_size);
        info!(
            sink = self.sink.name(),
            records = records.len(),
            batches = batch_count,
            max_batch_size = self.max_batch_size,
            "Uploading records"
        );

        for batch in partition(records, self.max_batch_size) {
            let is_final = batch.index + 1 == batch_count;

            let handle = match self.sink.submit(batch).await {
                Ok(handle) => handle,
                Err(source) => {
                    error!(batch = batch.index, error = %source, "Batch submission failed");
                    return Err(UploadFailure { report, source });
                },
            };
            report.batch_sizes.push(batch.len());

            if !is_final {
                report.records_uploaded += batch.len();
                continue;
            }

            report.awaited_batch = Some(batch.index);
            let waited = tokio::time::timeout(
                self.completion_timeout,
                self.sink.await_completion(&handle),
            )
            .await;

            let outcome = match waited {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout {
                    task_id: handle.task_id,
                    waited: self.completion_timeout,
                }),
            };
            if let Err(source) = outcome {
                error!(batch = batch.index, task_id = handle.task_id, error = %source, "Final batch did not complete");
                return Err(UploadFailure { report, source });
            }

            report.records_uploaded += batch.len();
            report.completed = true;
        }

        info!(
            records = report.records_uploaded,
            batches = report.batches_submitted(),
            "Upload complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use serde_json::json;

    fn records(n: usize) -> Vec<WireRecord> {
        (0..n)
            .map(|i| json!({ "id": i.to_string() }).as_object().cloned().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_partition_law() {
        let sink = MemorySink::new();
        let uploader = BatchUploader::new(Arc::new(sink.clone()));
        let input = records(15_000);

        let report = uploader.upload(&input).await.unwrap();

        assert_eq!(sink.batch_sizes(), vec![10_000, 5_000]);
        assert_eq!(sink.awaited(), vec![1]);
        assert_eq!(report.awaited_batch, Some(1));
        assert_eq!(report.records_uploaded, 15_000);
        assert!(report.completed);
        assert_eq!(sink.records(), input);
    }

    #[test]
    fn test_partition_exact_multiple() {
        let input = records(20);
        let sizes: Vec<_> = partition(&input, 10).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![10, 10]);
        assert_eq!(partition(&input, 0).count(), 20);
        assert_eq!(partition(&[], 10).count(), 0);
    }

    #[tokio::test]
    async fn test_empty_upload_submits_nothing() {
        let sink = MemorySink::new();
        let report = BatchUploader::new(Arc::new(sink.clone()))
            .upload(&[])
            .await
            .unwrap();

        assert!(sink.batch_sizes().is_empty());
        assert_eq!(report.records_uploaded, 0);
    }

    #[tokio::test]
    async fn test_submission_failure_keeps_partial_report() {
        let sink = MemorySink::new().fail_on_batch(2);
        let uploader = BatchUploader::new(Arc::new(sink.clone())).with_max_batch_size(4);

        let failure = uploader.upload(&records(10)).await.unwrap_err();

        assert_eq!(failure.report.records_uploaded, 8);
        assert_eq!(failure.report.batch_sizes, vec![4, 4]);
        assert!(!failure.report.completed);
        assert!(matches!(failure.source, SinkError::Rejected { batch_index: 2, .. }));

        let stats = failure.statistics();
        assert_eq!(stats.upload_failures, 1);
        assert_eq!(stats.records_uploaded, 8);
        assert!(sink.awaited().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_timeout() {
        let sink = MemorySink::new().never_complete();
        let uploader = BatchUploader::new(Arc::new(sink.clone()))
            .with_max_batch_size(5)
            .with_completion_timeout(Duration::from_secs(30));

        let failure = uploader.upload(&records(7)).await.unwrap_err();

        assert!(matches!(failure.source, SinkError::Timeout { .. }));
        assert_eq!(failure.report.batch_sizes, vec![5, 2]);
        assert_eq!(failure.report.records_uploaded, 5);
        assert_eq!(failure.report.awaited_batch, Some(1));
    }
}
