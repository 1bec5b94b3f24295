//! Enrichment event feeds
//!
//! - [`JsonLinesEventSource`] replays a JSON-lines file and keeps its committed read
//!   position in a sidecar file, so a re-run skips events already uploaded.
//! - [`ChannelEventSource`] reads from an in-process channel fed by a broker client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use serde_jsonlines::JsonLinesReader;
use std::collections::VecDeque;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{EnrichmentEvent, EventSource, ReadPosition};
use crate::error::FetchError;

/// A line carrying event metadata next to the payload.
///
/// Lines without a `payload` key are treated as bare payloads on partition 0, with the
/// line number as offset.
#[derive(Debug, Deserialize)]
struct EventEnvelope {
    payload: Value,
    #[serde(default)]
    partition: i32,
    offset: Option<i64>,
    timestamp: Option<DateTime<Utc>>,
}

/// Replays a JSON-lines file as an event feed.
///
/// The file is read once, on the first call to [`next_event`](EventSource::next_event)
/// or in [`open`](Self::open). Lines that are not JSON, or that carry a malformed
/// envelope, are logged and skipped.
#[derive(Debug)]
pub struct JsonLinesEventSource {
    path: PathBuf,
    position_path: PathBuf,
    pending: Option<VecDeque<EnrichmentEvent>>,
    skipped: usize,
    rejected: usize,
}

#[derive(Debug, Default)]
struct Replay {
    pending: VecDeque<EnrichmentEvent>,
    skipped: usize,
    rejected: usize,
}

impl JsonLinesEventSource {
    /// Source over `path`; nothing is read until first use
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            position_path: position_path_for(&path),
            path,
            pending: None,
            skipped: 0,
            rejected: 0,
        }
    }

    /// Load the feed now and drop events covered by a previously committed position
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let mut source = Self::new(path);
        source.load().await?;
        Ok(source)
    }

    async fn load(&mut self) -> Result<(), FetchError> {
        if self.pending.is_some() {
            return Ok(());
        }

        let committed = read_position(&self.position_path).await?;
        let path = self.path.clone();
        let loaded_at = Utc::now();
        let replay = tokio::task::spawn_blocking(move || replay_file(&path, &committed, loaded_at))
            .await
            .map_err(|e| FetchError::Io(std::io::Error::other(e)))??;

        info!(
            path = %self.path.display(),
            pending = replay.pending.len(),
            skipped = replay.skipped,
            rejected = replay.rejected,
            "Opened event file"
        );

        self.skipped = replay.skipped;
        self.rejected = replay.rejected;
        self.pending = Some(replay.pending);
        Ok(())
    }

    /// Events dropped on open because they were already committed
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn remaining(&self) -> usize {
        self.pending.as_ref().map_or(0, VecDeque::len)
    }

    pub fn position_path(&self) -> &Path {
        &self.position_path
    }
}

#[async_trait]
impl EventSource for JsonLinesEventSource {
    async fn next_event(&mut self) -> Result<Option<EnrichmentEvent>, FetchError> {
        self.load().await?;
        Ok(self.pending.as_mut().and_then(VecDeque::pop_front))
    }

    async fn commit(&mut self, position: &ReadPosition) -> Result<(), FetchError> {
        let mut merged = read_position(&self.position_path).await?;
        merged.absorb(position);
        let bytes = serde_json::to_vec_pretty(&merged)
            .map_err(|e| FetchError::payload(self.position_path.display().to_string(), e.to_string()))?;
        tokio::fs::write(&self.position_path, bytes).await?;
        debug!(path = %self.position_path.display(), "Committed read position");
        Ok(())
    }

    fn rejected(&self) -> u64 {
        self.rejected as u64
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

fn position_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".position.json");
    path.with_file_name(name)
}

async fn read_position(path: &Path) -> Result<ReadPosition, FetchError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::payload(path.display().to_string(), e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ReadPosition::new()),
        Err(e) => Err(e.into()),
    }
}

/// Blocking read of the whole file. Undecodable lines are counted, not fatal.
fn replay_file(
    path: &Path,
    committed: &ReadPosition,
    loaded_at: DateTime<Utc>,
) -> Result<Replay, FetchError> {
    let file = std::fs::File::open(path)?;
    let mut reader = JsonLinesReader::new(BufReader::new(file));
    let mut replay = Replay::default();

    let mut line: i64 = 0;
    loop {
        let decoded = match reader.read::<Value>() {
            Ok(Some(value)) => to_event(value, line, loaded_at),
            Ok(None) => break,
            // serde_json errors surface as InvalidData, or UnexpectedEof for a truncated line
            Err(e) if matches!(e.kind(), ErrorKind::InvalidData | ErrorKind::UnexpectedEof) => {
                Err(e.to_string())
            },
            Err(e) => return Err(e.into()),
        };

        match decoded {
            Ok(event) if committed.covers(event.partition, event.offset) => replay.skipped += 1,
            Ok(event) => replay.pending.push_back(event),
            Err(reason) => {
                replay.rejected += 1;
                warn!(
                    path = %path.display(),
                    line = line + 1,
                    reason = %reason,
                    "Skipping malformed event line"
                );
            },
        }
        line += 1;
    }

    Ok(replay)
}

fn to_event(value: Value, line: i64, loaded_at: DateTime<Utc>) -> Result<EnrichmentEvent, String> {
    let is_envelope = value.as_object().is_some_and(|o| o.contains_key("payload"));
    if !is_envelope {
        return Ok(EnrichmentEvent {
            payload: value,
            partition: 0,
            offset: line,
            timestamp: loaded_at,
        });
    }

    let envelope: EventEnvelope = serde_json::from_value(value).map_err(|e| e.to_string())?;
    Ok(EnrichmentEvent {
        payload: envelope.payload,
        partition: envelope.partition,
        offset: envelope.offset.unwrap_or(line),
        timestamp: envelope.timestamp.unwrap_or(loaded_at),
    })
}

/// Event feed backed by a tokio channel.
///
/// The feed ends when every sender is dropped. Committed positions are published on a
/// watch channel for whoever owns the broker-side offsets.
#[derive(Debug)]
pub struct ChannelEventSource {
    receiver: mpsc::Receiver<EnrichmentEvent>,
    committed: watch::Sender<ReadPosition>,
}

impl ChannelEventSource {
    pub fn channel(capacity: usize) -> (mpsc::Sender<EnrichmentEvent>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        let (committed, _) = watch::channel(ReadPosition::new());
        (sender, Self { receiver, committed })
    }

    /// Observe committed positions
    pub fn committed(&self) -> watch::Receiver<ReadPosition> {
        self.committed.subscribe()
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn next_event(&mut self) -> Result<Option<EnrichmentEvent>, FetchError> {
        Ok(self.receiver.recv().await)
    }

    async fn commit(&mut self, position: &ReadPosition) -> Result<(), FetchError> {
        self.committed.send_modify(|committed| committed.absorb(position));
        Ok(())
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_lines(path: &Path, lines: &[Value]) {
        serde_jsonlines::write_json_lines(path, lines).unwrap();
    }

    #[tokio::test]
    async fn test_bare_and_enveloped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        write_lines(
            &path,
            &[
                json!({ "objectID": "1", "rating": 5 }),
                json!({
                    "payload": { "id": "2", "popularity": 10 },
                    "partition": 3,
                    "offset": 42,
                    "timestamp": "2026-10-14T08:00:00Z"
                }),
            ],
        );

        let mut source = JsonLinesEventSource::open(&path).await.unwrap();
        let first = source.next_event().await.unwrap().unwrap();
        assert_eq!(first.partition, 0);
        assert_eq!(first.offset, 0);
        assert_eq!(first.payload["rating"], 5);

        let second = source.next_event().await.unwrap().unwrap();
        assert_eq!(second.partition, 3);
        assert_eq!(second.offset, 42);
        assert_eq!(second.timestamp.to_rfc3339(), "2026-10-14T08:00:00+00:00");

        assert!(source.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reopen_skips_committed_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let lines: Vec<Value> = (0..4).map(|i| json!({ "id": i.to_string() })).collect();
        write_lines(&path, &lines);

        let mut source = JsonLinesEventSource::open(&path).await.unwrap();
        let mut position = ReadPosition::new();
        for _ in 0..2 {
            let event = source.next_event().await.unwrap().unwrap();
            position.advance(event.partition, event.offset);
        }
        source.commit(&position).await.unwrap();

        let reopened = JsonLinesEventSource::open(&path).await.unwrap();
        assert_eq!(reopened.skipped(), 2);
        assert_eq!(reopened.remaining(), 2);
        assert!(reopened.position_path().exists());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(
            &path,
            "{\"id\":\"1\",\"rating\":5}\n{not json\n{\"payload\": 3, \"partition\": \"x\"}\n{\"id\":\"2\",\"rating\":4}\n",
        )
        .unwrap();

        let mut source = JsonLinesEventSource::open(&path).await.unwrap();
        assert_eq!(source.remaining(), 2);
        assert_eq!(source.rejected(), 2);

        let first = source.next_event().await.unwrap().unwrap();
        assert_eq!(first.payload["id"], "1");
        assert_eq!(first.offset, 0);

        // Offsets follow line numbers, rejected lines included
        let second = source.next_event().await.unwrap().unwrap();
        assert_eq!(second.payload["id"], "2");
        assert_eq!(second.offset, 3);
        assert!(source.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_is_read_on_first_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let mut source = JsonLinesEventSource::new(&path);
        write_lines(&path, &[json!({ "id": "late" })]);

        let event = source.next_event().await.unwrap().unwrap();
        assert_eq!(event.payload["id"], "late");
        assert_eq!(source.remaining(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_fails_on_read() {
        let mut source = JsonLinesEventSource::new("/nonexistent/events.jsonl");
        let err = source.next_event().await.unwrap_err();
        assert!(matches!(err, FetchError::Io(_)));
    }

    #[tokio::test]
    async fn test_channel_source_publishes_commits() {
        let (sender, mut source) = ChannelEventSource::channel(4);
        let committed = source.committed();

        sender
            .send(EnrichmentEvent {
                payload: json!({ "id": "1" }),
                partition: 1,
                offset: 9,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        drop(sender);

        let event = source.next_event().await.unwrap().unwrap();
        let mut position = ReadPosition::new();
        position.advance(event.partition, event.offset);
        source.commit(&position).await.unwrap();

        assert_eq!(committed.borrow().next_offset(1), Some(10));
        assert!(source.next_event().await.unwrap().is_none());
    }
}
