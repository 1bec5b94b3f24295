//! Local file sources
//!
//! Used for offline runs and fixtures. A paged file is a single JSON array that is
//! read once and then served in `limit`/`offset` slices, so the fetcher behaves the
//! same as against the remote API.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tracing::debug;

use super::http::json_kind;
use super::{DocumentSource, PageSource};
use crate::error::FetchError;

#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    records: OnceCell<Vec<Value>>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_records(&self) -> Result<Vec<Value>, FetchError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::payload(self.path.display().to_string(), e.to_string()))?;

        match body {
            Value::Array(records) => {
                debug!(path = %self.path.display(), records = records.len(), "Loaded paged file");
                Ok(records)
            },
            other => Err(FetchError::payload(
                self.path.display().to_string(),
                format!("expected a JSON array, got {}", json_kind(&other)),
            )),
        }
    }
}

#[async_trait]
impl PageSource for FileSource {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Value>, FetchError> {
        let records = self.records.get_or_try_init(|| self.load_records()).await?;
        let start = offset.min(records.len());
        let end = offset.saturating_add(limit).min(records.len());
        Ok(records[start..end].to_vec())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[async_trait]
impl DocumentSource for FileSource {
    async fn fetch_document(&self) -> Result<Vec<u8>, FetchError> {
        Ok(tokio::fs::read(&self.path).await?)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pages_are_sliced_from_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.json");
        let records: Vec<Value> = (0..5).map(|i| json!({ "id": i })).collect();
        std::fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();

        let source = FileSource::new(&path);
        assert_eq!(source.fetch_page(0, 2).await.unwrap().len(), 2);
        assert_eq!(source.fetch_page(4, 2).await.unwrap(), vec![json!({ "id": 4 })]);
        assert!(source.fetch_page(10, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_array_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.json");
        std::fs::write(&path, r#"{"id": 1}"#).unwrap();

        let err = FileSource::new(&path).fetch_page(0, 10).await.unwrap_err();
        assert!(matches!(err, FetchError::Payload { .. }));
    }

    #[tokio::test]
    async fn test_missing_document_is_io_error() {
        let err = FileSource::new("/nonexistent/catalog.xml")
            .fetch_document()
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Io(_)));
    }
}
