//! Single sync run
//!
//! One run walks every source in full before anything is uploaded:
//!
//! 1. Reload merge state from the snapshot
//! 2. Identity pages (rate-limited, retried) merged at [`SourceRank::Identity`]
//! 3. The catalog document merged at [`SourceRank::Catalog`]
//! 4. Pending enrichment events merged at [`SourceRank::Enrichment`]
//! 5. Upload of the full canonical record set
//! 6. Snapshot save and event position commit, only once the upload completed
//!
//! A dry run swaps the configured sink for a [`MemorySink`] and persists nothing.

use chrono::Utc;
use prodsync_common::{SourceRank, SyncError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::fetcher::PaginatedFetcher;
use crate::merge::MergeEngine;
use crate::parsers::{parse_catalog, parse_events, parse_identity_page};
use crate::rate_limit::RateLimiter;
use crate::sink::{self, IndexSink, MemorySink};
use crate::snapshot::SnapshotStore;
use crate::sources::{DocumentSource, EventSource, ReadPosition, SourcePayloadProvider};
use crate::stats::RunStatistics;
use crate::uploader::BatchUploader;

/// Run switches from the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Upload into memory and persist nothing
    pub dry_run: bool,
    /// Leave the event feed alone
    pub skip_events: bool,
}

/// Step a run failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Snapshot,
    Identity,
    Catalog,
    Events,
    Upload,
    Commit,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Snapshot => "snapshot",
            SyncStage::Identity => "identity",
            SyncStage::Catalog => "catalog",
            SyncStage::Events => "events",
            SyncStage::Upload => "upload",
            SyncStage::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// A run that stopped early, with whatever it counted before stopping
#[derive(Error, Debug)]
#[error("Sync run {run_id} failed during {stage}: {error}")]
pub struct PipelineFailure {
    pub run_id: Uuid,
    pub stage: SyncStage,
    pub statistics: RunStatistics,
    #[source]
    pub error: SyncError,
}

pub struct SyncPipeline {
    run_id: Uuid,
    options: PipelineOptions,
    identity: PaginatedFetcher,
    catalog: Box<dyn DocumentSource>,
    events: Option<Box<dyn EventSource>>,
    uploader: BatchUploader,
    snapshot: Option<SnapshotStore>,
    engine: MergeEngine,
}

impl SyncPipeline {
    pub fn new(
        identity: PaginatedFetcher,
        catalog: Box<dyn DocumentSource>,
        uploader: BatchUploader,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            options: PipelineOptions::default(),
            identity,
            catalog,
            events: None,
            uploader,
            snapshot: None,
            engine: MergeEngine::new(),
        }
    }

    pub fn with_events(mut self, events: Box<dyn EventSource>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotStore) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Wire every component from configuration
    pub fn from_config(config: &IngestConfig, options: PipelineOptions) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP client: {}", e)))?;

        let page_source = SourcePayloadProvider::from_location(&config.paged_source, &client)
            .into_page_source()?;
        let catalog = SourcePayloadProvider::from_location(&config.catalog_source, &client)
            .into_document_source()?;

        let fetcher = PaginatedFetcher::new(
            Arc::from(page_source),
            RateLimiter::new(config.rate_limit()),
            config.retry_policy(),
            config.page_size,
        );

        let run_id = Uuid::new_v4();
        let sink: Arc<dyn IndexSink> = if options.dry_run {
            Arc::new(MemorySink::new())
        } else {
            sink::from_config(config, &client, &run_id.to_string())?
        };
        let uploader = BatchUploader::new(sink)
            .with_max_batch_size(config.batch_size)
            .with_completion_timeout(config.completion_timeout);

        let mut pipeline = Self::new(fetcher, catalog, uploader)
            .with_snapshot(SnapshotStore::new(&config.snapshot_path))
            .with_options(options);
        pipeline.run_id = run_id;

        if let Some(path) = config.events_source.as_ref().filter(|_| !options.skip_events) {
            let events = SourcePayloadProvider::event_file(path).into_event_source()?;
            pipeline = pipeline.with_events(events);
        }

        Ok(pipeline)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Merge state as of the last run
    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    pub async fn run(&mut self) -> Result<RunStatistics, PipelineFailure> {
        let span = info_span!("sync", run_id = %self.run_id, dry_run = self.options.dry_run);
        self.run_stages().instrument(span).await
    }

    async fn run_stages(&mut self) -> Result<RunStatistics, PipelineFailure> {
        let mut stats = RunStatistics::new();
        info!("Sync run starting");

        self.load_snapshot()
            .await
            .map_err(|e| self.failure(SyncStage::Snapshot, &stats, e))?;

        match self.merge_identity().await {
            Ok(partial) => stats += partial,
            Err(e) => return Err(self.failure(SyncStage::Identity, &stats, e)),
        }

        match self.merge_catalog().await {
            Ok(partial) => stats += partial,
            Err(e) => return Err(self.failure(SyncStage::Catalog, &stats, e)),
        }

        let position = match self.merge_events().await {
            Ok((partial, position)) => {
                stats += partial;
                position
            },
            Err(e) => return Err(self.failure(SyncStage::Events, &stats, e)),
        };

        let records = self.engine.canonical_records();
        match self.uploader.upload(&records).await {
            Ok(report) => stats += report.statistics(),
            Err(failure) => {
                stats += failure.statistics();
                let error = SyncError::from(failure.source);
                return Err(self.failure(SyncStage::Upload, &stats, error));
            },
        }

        if !self.options.dry_run {
            self.persist(&position)
                .await
                .map_err(|e| self.failure(SyncStage::Commit, &stats, e))?;
        }

        info!(
            records = self.engine.len(),
            conflicts = self.engine.conflicts().len(),
            "Sync run complete"
        );
        Ok(stats)
    }

    fn failure(&self, stage: SyncStage, stats: &RunStatistics, error: SyncError) -> PipelineFailure {
        PipelineFailure {
            run_id: self.run_id,
            stage,
            statistics: stats.clone(),
            error,
        }
    }

    async fn load_snapshot(&mut self) -> Result<(), SyncError> {
        let Some(store) = &self.snapshot else {
            return Ok(());
        };
        match store.load().await? {
            Some(snapshot) => self.engine = MergeEngine::from_snapshot(snapshot),
            None => info!(path = %store.path().display(), "No snapshot, starting empty"),
        }
        Ok(())
    }

    async fn merge_identity(&mut self) -> Result<RunStatistics, SyncError> {
        let (pages, mut stats) = self.identity.fetch_all_pages().await?;
        for page in &pages {
            let report = parse_identity_page(&page.records, page.cursor.offset);
            stats += report.statistics();
            stats += self.engine.apply_all(&report.records, SourceRank::Identity);
        }
        info!(
            records = stats.records_parsed,
            rejected = stats.records_rejected,
            "Merged identity records"
        );
        Ok(stats)
    }

    async fn merge_catalog(&mut self) -> Result<RunStatistics, SyncError> {
        let bytes = self.catalog.fetch_document().await?;
        info!(
            source = %self.catalog.describe(),
            bytes = bytes.len(),
            "Fetched catalog document"
        );

        let report = parse_catalog(&bytes)?;
        let mut stats = report.statistics();
        stats.records_fetched += (report.records.len() + report.rejections.len()) as u64;
        stats += self.engine.apply_all(&report.records, SourceRank::Catalog);

        info!(
            records = report.records.len(),
            rejected = report.rejections.len(),
            conflicts = stats.conflicts,
            "Merged catalog records"
        );
        Ok(stats)
    }

    /// Drain the event feed; returns the position to commit after upload
    async fn merge_events(&mut self) -> Result<(RunStatistics, ReadPosition), SyncError> {
        let mut position = ReadPosition::new();
        let Some(source) = self.events.as_mut() else {
            return Ok((RunStatistics::new(), position));
        };

        let mut events = Vec::new();
        while let Some(event) = source.next_event().await? {
            position.advance(event.partition, event.offset);
            events.push(event);
        }

        let report = parse_events(&events, Utc::now());
        let mut stats = report.statistics();
        stats.events_consumed = events.len() as u64;
        stats.records_rejected += source.rejected();
        stats += self.engine.apply_all(&report.records, SourceRank::Enrichment);

        info!(
            source = %source.describe(),
            events = events.len(),
            rejected = stats.records_rejected,
            conflicts = stats.conflicts,
            "Merged enrichment events"
        );
        Ok((stats, position))
    }

    async fn persist(&mut self, position: &ReadPosition) -> Result<(), SyncError> {
        if let Some(store) = &self.snapshot {
            store.save(&self.engine.snapshot()).await?;
        }
        if let Some(source) = self.events.as_mut() {
            if !position.is_empty() {
                source.commit(position).await?;
            }
        }
        if !self.engine.conflicts().is_empty() {
            warn!(
                conflicts = self.engine.conflicts().len(),
                "Run finished with rejected lower-rank writes"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitConfig;
    use crate::retry::RetryPolicy;
    use crate::sources::{ChannelEventSource, EnrichmentEvent, FileSource};
    use serde_json::json;
    use std::time::Duration;

    const CATALOG: &str = r#"<?xml version="1.0"?>
<products>
  <product>
    <id>1</id>
    <name>Catalog Name</name>
    <price>100</price>
  </product>
</products>"#;

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn pipeline(dir: &tempfile::TempDir, sink: MemorySink) -> SyncPipeline {
        let identity = write(dir, "identity.json", r#"[{"id": 1, "sku": "SKU-1"}, {"id": "2"}]"#);
        let catalog = write(dir, "catalog.xml", CATALOG);
        let fetcher = PaginatedFetcher::new(
            Arc::new(FileSource::new(identity)),
            RateLimiter::new(RateLimitConfig::default()),
            RetryPolicy::none(),
            1000,
        );
        SyncPipeline::new(
            fetcher,
            Box::new(FileSource::new(catalog)),
            BatchUploader::new(Arc::new(sink)),
        )
    }

    fn event(payload: serde_json::Value, offset: i64) -> EnrichmentEvent {
        EnrichmentEvent {
            payload,
            partition: 0,
            offset,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_catalog_beats_enrichment() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::new();
        let (sender, events) = ChannelEventSource::channel(8);
        let committed = events.committed();
        sender
            .send(event(json!({"id": "1", "name": "Kafka Name", "rating": 5}), 0))
            .await
            .unwrap();
        drop(sender);

        let mut pipeline = pipeline(&dir, sink.clone()).with_events(Box::new(events));
        let stats = pipeline.run().await.unwrap();

        let record = pipeline.engine().record("1").unwrap();
        assert_eq!(record.value("name"), Some(&json!("Catalog Name")));
        assert_eq!(record.value("price"), Some(&json!(100.0)));
        assert_eq!(record.value("rating"), Some(&json!(5)));
        assert_eq!(record.value("sku"), Some(&json!("SKU-1")));
        assert_eq!(pipeline.engine().conflicts().len(), 1);
        assert_eq!(pipeline.engine().conflicts()[0].field, "name");

        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.events_consumed, 1);
        assert_eq!(stats.records_uploaded, 2);
        assert_eq!(sink.records().len(), 2);
        assert_eq!(committed.borrow().next_offset(0), Some(1));
    }

    #[tokio::test]
    async fn test_snapshot_carries_state_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state").join("snapshot.json"));

        let mut first = pipeline(&dir, MemorySink::new()).with_snapshot(store.clone());
        first.run().await.unwrap();
        assert!(store.path().exists());

        let mut second = pipeline(&dir, MemorySink::new()).with_snapshot(store.clone());
        let stats = second.run().await.unwrap();

        assert_eq!(stats.records_created, 0);
        assert_eq!(stats.conflicts, 0);
        assert_eq!(stats.fields_written, 0);
        assert!(stats.fields_unchanged > 0);
    }

    #[tokio::test]
    async fn test_dry_run_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));
        let sink = MemorySink::new();

        let mut pipeline = pipeline(&dir, sink.clone())
            .with_snapshot(store.clone())
            .with_options(PipelineOptions {
                dry_run: true,
                skip_events: false,
            });
        pipeline.run().await.unwrap();

        assert_eq!(sink.records().len(), 2);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_statistics_and_skips_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));

        let mut pipeline =
            pipeline(&dir, MemorySink::new().fail_on_batch(0)).with_snapshot(store.clone());
        let failure = pipeline.run().await.unwrap_err();

        assert_eq!(failure.stage, SyncStage::Upload);
        assert_eq!(failure.statistics.upload_failures, 1);
        assert_eq!(failure.statistics.records_parsed, 3);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_missing_catalog_fails_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::new();
        let mut pipeline = pipeline(&dir, sink.clone());
        pipeline.catalog = Box::new(FileSource::new(dir.path().join("absent.xml")));

        let failure = pipeline.run().await.unwrap_err();

        assert_eq!(failure.stage, SyncStage::Catalog);
        assert_eq!(failure.statistics.records_parsed, 2);
        assert!(sink.batch_sizes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_timeout_is_an_upload_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(&dir, MemorySink::new());
        pipeline.uploader = BatchUploader::new(Arc::new(MemorySink::new().never_complete()))
            .with_completion_timeout(Duration::from_secs(5));

        let failure = pipeline.run().await.unwrap_err();
        assert_eq!(failure.stage, SyncStage::Upload);
        assert!(matches!(failure.error, SyncError::Timeout(_)));
    }
}
