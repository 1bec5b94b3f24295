//! Merge state persistence
//!
//! The catalog runs on a fixed schedule while enrichment events arrive continuously.
//! Without persisted state, enrichment applied between two catalog runs would be
//! unknown to the next run. The snapshot keeps every field with its rank and write
//! time so the next run merges against it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::SnapshotError;
use crate::merge::CanonicalRecord;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable merge state. Conflicts are per-run data and are not included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub records: Vec<CanonicalRecord>,
}

impl MergeSnapshot {
    pub fn new(records: Vec<CanonicalRecord>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            records,
        }
    }
}

/// Snapshot file on local disk
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SnapshotError {
        SnapshotError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    /// Load the last snapshot; `None` on the first run
    pub async fn load(&self) -> Result<Option<MergeSnapshot>, SnapshotError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot yet");
                return Ok(None);
            },
            Err(e) => return Err(self.io_error(e)),
        };

        let snapshot: MergeSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }

        info!(
            path = %self.path.display(),
            records = snapshot.records.len(),
            taken_at = %snapshot.taken_at,
            "Loaded merge snapshot"
        );
        Ok(Some(snapshot))
    }

    /// Write the snapshot through a temporary file so a crash never leaves a
    /// truncated snapshot behind
    pub async fn save(&self, snapshot: &MergeSnapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let bytes = serde_json::to_vec(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        info!(
            path = %self.path.display(),
            records = snapshot.records.len(),
            bytes = bytes.len(),
            "Saved merge snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::merge::MergeEngine;
    use prodsync_common::SourceRank;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("canonical.snapshot.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state").join("canonical.snapshot.json"));

        let mut engine = MergeEngine::new();
        let fields = json!({ "name": "Catalog", "price": 9.5 });
        engine.apply("1", fields.as_object().unwrap(), SourceRank::Catalog);
        let fields = json!({ "rating": 4 });
        engine.apply("1", fields.as_object().unwrap(), SourceRank::Enrichment);

        store.save(&engine.snapshot()).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        let restored = MergeEngine::from_snapshot(loaded);

        let record = restored.record("1").unwrap();
        assert_eq!(record, engine.record("1").unwrap());
        assert_eq!(record.get("rating").unwrap().rank, SourceRank::Enrichment);
        assert_eq!(record.get("price").unwrap().rank, SourceRank::Catalog);
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canonical.snapshot.json");
        std::fs::write(
            &path,
            r#"{"version": 99, "taken_at": "2026-10-14T00:00:00Z", "records": []}"#,
        )
        .unwrap();

        let err = SnapshotStore::new(&path).load().await.unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::UnsupportedVersion { found: 99, expected: 1 }
        ));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canonical.snapshot.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = SnapshotStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt(_)));
    }
}
