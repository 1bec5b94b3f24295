//! Upstream source capabilities
//!
//! Three traits describe what the pipeline needs from each source:
//!
//! - [`PageSource`]: paged minimal records (`limit`/`offset`)
//! - [`DocumentSource`]: one whole catalog document
//! - [`EventSource`]: an ordered, partitioned event feed with a committed read position
//!
//! Which implementation backs a source is decided once, when the
//! [`SourcePayloadProvider`] is built from configuration, and never re-checked per call.

pub mod events;
pub mod file;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{ConfigError, FetchError};

pub use events::{ChannelEventSource, JsonLinesEventSource};
pub use file::FileSource;
pub use http::HttpSource;

/// Largest page the paginated source will serve
pub const MAX_PAGE_SIZE: usize = 1000;

/// Source of paged minimal records
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch up to `limit` raw records starting at `offset`. An empty page means the
    /// end of the data.
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Value>, FetchError>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// Source of one complete document, fetched whole
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(&self) -> Result<Vec<u8>, FetchError>;

    fn describe(&self) -> String;
}

/// Ordered, partitioned event feed with at-least-once delivery
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or `None` once the feed is exhausted
    async fn next_event(&mut self) -> Result<Option<EnrichmentEvent>, FetchError>;

    /// Persist `position` so a restarted consumer resumes after the committed events
    async fn commit(&mut self, position: &ReadPosition) -> Result<(), FetchError>;

    /// Raw entries the feed dropped because they could not be decoded
    fn rejected(&self) -> u64 {
        0
    }

    fn describe(&self) -> String;
}

/// One raw event from the real-time feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentEvent {
    pub payload: Value,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
}

/// Next offset to read, per partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPosition(BTreeMap<i32, i64>);

impl ReadPosition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `offset` on `partition` as consumed. Positions never move backwards.
    pub fn advance(&mut self, partition: i32, offset: i64) {
        let next = offset + 1;
        let entry = self.0.entry(partition).or_insert(next);
        if *entry < next {
            *entry = next;
        }
    }

    /// Fold another position into this one, keeping the furthest offset per partition
    pub fn absorb(&mut self, other: &ReadPosition) {
        for (&partition, &next) in &other.0 {
            self.advance(partition, next - 1);
        }
    }

    /// Next offset to read on `partition`
    pub fn next_offset(&self, partition: i32) -> Option<i64> {
        self.0.get(&partition).copied()
    }

    /// Whether the event at `offset` on `partition` was already committed
    pub fn covers(&self, partition: i32, offset: i64) -> bool {
        self.next_offset(partition).is_some_and(|next| offset < next)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn partitions(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.0.iter().map(|(&p, &o)| (p, o))
    }
}

/// Where a source's payloads come from, chosen once at construction
pub enum SourcePayloadProvider {
    RemoteHttp(HttpSource),
    LocalFile(FileSource),
    EventStream(Box<dyn EventSource>),
}

impl SourcePayloadProvider {
    /// `http://` and `https://` locations select the remote provider; anything else
    /// is read from the local filesystem.
    pub fn from_location(location: &str, client: &reqwest::Client) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            SourcePayloadProvider::RemoteHttp(HttpSource::new(client.clone(), location))
        } else {
            SourcePayloadProvider::LocalFile(FileSource::new(PathBuf::from(location)))
        }
    }

    /// Event feed replayed from a JSON-lines file, read on first use
    pub fn event_file(path: impl Into<PathBuf>) -> Self {
        SourcePayloadProvider::EventStream(Box::new(JsonLinesEventSource::new(path)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourcePayloadProvider::RemoteHttp(_) => "remote-http",
            SourcePayloadProvider::LocalFile(_) => "local-file",
            SourcePayloadProvider::EventStream(_) => "event-stream",
        }
    }

    pub fn into_page_source(self) -> Result<Box<dyn PageSource>, ConfigError> {
        match self {
            SourcePayloadProvider::RemoteHttp(source) => Ok(Box::new(source)),
            SourcePayloadProvider::LocalFile(source) => Ok(Box::new(source)),
            SourcePayloadProvider::EventStream(_) => Err(ConfigError::invalid(
                "PRODSYNC_PAGED_SOURCE",
                "an event stream cannot serve pages",
            )),
        }
    }

    pub fn into_document_source(self) -> Result<Box<dyn DocumentSource>, ConfigError> {
        match self {
            SourcePayloadProvider::RemoteHttp(source) => Ok(Box::new(source)),
            SourcePayloadProvider::LocalFile(source) => Ok(Box::new(source)),
            SourcePayloadProvider::EventStream(_) => Err(ConfigError::invalid(
                "PRODSYNC_CATALOG_SOURCE",
                "an event stream cannot serve a catalog document",
            )),
        }
    }

    pub fn into_event_source(self) -> Result<Box<dyn EventSource>, ConfigError> {
        match self {
            SourcePayloadProvider::EventStream(source) => Ok(source),
            other => Err(ConfigError::invalid(
                "PRODSYNC_EVENTS_SOURCE",
                format!("{} provider is not an event stream", other.kind()),
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_read_position_never_moves_backwards() {
        let mut position = ReadPosition::new();
        position.advance(0, 10);
        position.advance(0, 4);
        position.advance(1, 0);

        assert_eq!(position.next_offset(0), Some(11));
        assert_eq!(position.next_offset(1), Some(1));
        assert_eq!(position.next_offset(2), None);
        assert!(position.covers(0, 10));
        assert!(!position.covers(0, 11));
        assert!(!position.covers(2, 0));
    }

    #[test]
    fn test_read_position_absorb() {
        let mut committed = ReadPosition::new();
        committed.advance(0, 3);

        let mut pending = ReadPosition::new();
        pending.advance(0, 7);
        pending.advance(2, 1);

        committed.absorb(&pending);
        assert_eq!(committed.partitions().collect::<Vec<_>>(), vec![(0, 8), (2, 2)]);
    }

    #[test]
    fn test_provider_selected_by_location() {
        let client = reqwest::Client::new();
        let remote = SourcePayloadProvider::from_location("https://api.example.com/products", &client);
        assert_eq!(remote.kind(), "remote-http");

        let local = SourcePayloadProvider::from_location("./data/catalog.xml", &client);
        assert_eq!(local.kind(), "local-file");
        assert!(local.into_event_source().is_err());
    }
}
