//! prodsync Ingest Library
//!
//! Reconciles product records from three upstream sources into one canonical record
//! set and uploads it to a search index in bounded batches.
//!
//! # Sources
//!
//! - **Paginated API**: minimal identity records, fetched under a caller-side rate limit
//! - **XML catalog**: the authoritative full catalog, fetched whole on every run
//! - **Enrichment events**: a partitioned real-time feed with consumer-managed offsets
//!
//! # Flow
//!
//! ```text
//! RateLimiter -> PaginatedFetcher -> parsers -> MergeEngine -> BatchUploader -> IndexSink
//! ```
//!
//! # Example
//!
//! ```no_run
//! use prodsync_ingest::config::IngestConfig;
//! use prodsync_ingest::pipeline::{PipelineOptions, SyncPipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let mut pipeline = SyncPipeline::from_config(&config, PipelineOptions::default())?;
//!     let stats = pipeline.run().await?;
//!     stats.log_summary();
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod consumer;
pub mod error;
pub mod fetcher;
pub mod merge;
pub mod parsers;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod sink;
pub mod snapshot;
pub mod sources;
pub mod stats;
pub mod uploader;

pub use error::{ConfigError, FetchError, ParseError, SinkError, SnapshotError};
pub use merge::{CanonicalRecord, Conflict, MergeEngine};
pub use stats::RunStatistics;
