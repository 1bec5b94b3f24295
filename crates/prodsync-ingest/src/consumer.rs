//! Continuous enrichment consumer
//!
//! Reads the event feed until it ends or the [`CancellationToken`] fires. Each event is
//! merged at [`SourceRank::Enrichment`] right away; the touched records are buffered
//! and uploaded once `batch_size` events have accumulated.
//!
//! The read position is committed only after the upload holding those events
//! completed and the snapshot was saved. A failed upload leaves the position and the
//! buffer in place, so the next flush retries the same records and a restart replays
//! the same events.
//!
//! On shutdown the consumer stops reading and flushes whatever is buffered. If that
//! last upload fails the run ends with a [`ConsumerFailure`].

use chrono::Utc;
use prodsync_common::{SourceRank, SyncError};
use std::collections::HashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::error::SinkError;
use crate::merge::MergeEngine;
use crate::parsers::parse_event;
use crate::sink;
use crate::snapshot::SnapshotStore;
use crate::sources::{EnrichmentEvent, EventSource, ReadPosition, SourcePayloadProvider};
use crate::stats::RunStatistics;
use crate::uploader::BatchUploader;

/// A consume run that stopped with events it could not upload or commit
#[derive(Error, Debug)]
#[error("Enrichment consumer stopped with {buffered} events pending: {error}")]
pub struct ConsumerFailure {
    pub statistics: RunStatistics,
    /// Events merged but neither uploaded nor committed
    pub buffered: usize,
    #[source]
    pub error: SyncError,
}

enum FlushOutcome {
    Committed,
    /// Upload failed; buffer and position kept for the next flush
    Retained(SinkError),
}

pub struct EnrichmentConsumer {
    source: Box<dyn EventSource>,
    engine: MergeEngine,
    uploader: BatchUploader,
    snapshot: Option<SnapshotStore>,
    batch_size: usize,
    pending_ids: Vec<String>,
    pending_set: HashSet<String>,
    pending_position: ReadPosition,
    buffered_events: usize,
    stats: RunStatistics,
}

impl EnrichmentConsumer {
    pub fn new(source: Box<dyn EventSource>, engine: MergeEngine, uploader: BatchUploader) -> Self {
        Self {
            source,
            engine,
            uploader,
            snapshot: None,
            batch_size: crate::config::DEFAULT_CONSUMER_BATCH_SIZE,
            pending_ids: Vec::new(),
            pending_set: HashSet::new(),
            pending_position: ReadPosition::new(),
            buffered_events: 0,
            stats: RunStatistics::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotStore) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Build from configuration, resuming from the stored snapshot
    pub async fn from_config(config: &IngestConfig) -> Result<Self, SyncError> {
        let path = config.events_source.as_ref().ok_or_else(|| {
            SyncError::from(crate::error::ConfigError::Missing(vec![
                "PRODSYNC_EVENTS_SOURCE".to_string(),
            ]))
        })?;
        let source = SourcePayloadProvider::event_file(path).into_event_source()?;

        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP client: {}", e)))?;
        let prefix = format!("consume-{}", uuid::Uuid::new_v4());
        let uploader = BatchUploader::new(sink::from_config(config, &client, &prefix)?)
            .with_max_batch_size(config.batch_size)
            .with_completion_timeout(config.completion_timeout);

        let store = SnapshotStore::new(&config.snapshot_path);
        let engine = match store.load().await? {
            Some(snapshot) => MergeEngine::from_snapshot(snapshot),
            None => MergeEngine::new(),
        };

        Ok(Self::new(source, engine, uploader)
            .with_batch_size(config.consumer_batch_size)
            .with_snapshot(store))
    }

    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    /// Events merged but not yet uploaded
    pub fn buffered(&self) -> usize {
        self.buffered_events
    }

    pub fn statistics(&self) -> &RunStatistics {
        &self.stats
    }

    /// Consume until the feed ends or `cancel` fires, then flush.
    ///
    /// Upload failures at the batch threshold are retried on the next flush; a failure
    /// of the final flush is returned.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunStatistics, ConsumerFailure> {
        info!(
            source = %self.source.describe(),
            batch_size = self.batch_size,
            "Enrichment consumer started"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, stopping intake");
                    break;
                }
                next = self.source.next_event() => next,
            };

            match next {
                Ok(Some(event)) => self.handle(&event),
                Ok(None) => {
                    info!("Event feed exhausted");
                    break;
                },
                Err(e) => {
                    error!(error = %e, "Event feed failed");
                    if let Err(flush_error) = self.flush().await {
                        warn!(error = %flush_error, "Flush after feed failure did not complete");
                    }
                    return Err(self.failure(e.into()));
                },
            }

            if self.buffered_events >= self.batch_size {
                self.try_flush().await.map_err(|e| self.failure(e))?;
            }
        }

        self.stats.records_rejected += self.source.rejected();
        if let Err(e) = self.flush().await {
            error!(error = %e, buffered = self.buffered_events, "Final flush failed");
            return Err(self.failure(e));
        }
        info!(
            events = self.stats.events_consumed,
            uploaded = self.stats.records_uploaded,
            "Enrichment consumer stopped"
        );
        Ok(self.stats.clone())
    }

    fn failure(&self, error: SyncError) -> ConsumerFailure {
        ConsumerFailure {
            statistics: self.stats.clone(),
            buffered: self.buffered_events,
            error,
        }
    }

    fn handle(&mut self, event: &EnrichmentEvent) {
        let index = self.stats.events_consumed as usize;
        self.stats.events_consumed += 1;
        self.buffered_events += 1;
        self.pending_position.advance(event.partition, event.offset);

        match parse_event(event, index, Utc::now()) {
            Ok(record) => {
                self.stats.records_parsed += 1;
                self.stats += self.engine.apply_parsed(&record, SourceRank::Enrichment).statistics();
                if self.pending_set.insert(record.id.clone()) {
                    self.pending_ids.push(record.id);
                }
            },
            Err(rejection) => {
                self.stats.records_rejected += 1;
                warn!(
                    partition = event.partition,
                    offset = event.offset,
                    reason = %rejection.reason,
                    "Rejected enrichment event"
                );
            },
        }
    }

    /// Upload buffered records, then save the snapshot and commit the position.
    ///
    /// An upload failure is counted, leaves everything buffered and is returned.
    pub async fn flush(&mut self) -> Result<(), SyncError> {
        match self.try_flush().await? {
            FlushOutcome::Committed => Ok(()),
            FlushOutcome::Retained(e) => Err(e.into()),
        }
    }

    async fn try_flush(&mut self) -> Result<FlushOutcome, SyncError> {
        if self.buffered_events == 0 {
            return Ok(FlushOutcome::Committed);
        }

        let records = self.engine.canonical_records_for(&self.pending_ids);
        debug!(
            events = self.buffered_events,
            records = records.len(),
            "Flushing enrichment buffer"
        );

        match self.uploader.upload(&records).await {
            Ok(report) => self.stats += report.statistics(),
            Err(failure) => {
                self.stats += failure.statistics();
                warn!(
                    error = %failure,
                    buffered = self.buffered_events,
                    "Upload failed, read position not advanced"
                );
                return Ok(FlushOutcome::Retained(failure.source));
            },
        }

        if let Some(store) = &self.snapshot {
            store.save(&self.engine.snapshot()).await?;
        }
        self.source.commit(&self.pending_position).await?;

        info!(
            events = self.buffered_events,
            records = records.len(),
            "Committed enrichment batch"
        );
        self.pending_ids.clear();
        self.pending_set.clear();
        self.pending_position = ReadPosition::new();
        self.buffered_events = 0;
        Ok(FlushOutcome::Committed)
    }
}
