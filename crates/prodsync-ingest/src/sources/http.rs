//! Remote HTTP sources

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::{DocumentSource, PageSource};
use crate::error::FetchError;

/// A source served over HTTP.
///
/// As a [`PageSource`] it issues `GET <url>?limit=<n>&offset=<m>` and expects a JSON
/// array. As a [`DocumentSource`] it downloads the body as-is.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    url: String,
}

impl HttpSource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn get(&self, query: &[(&str, usize)]) -> Result<reqwest::Response, FetchError> {
        let response = self.client.get(&self.url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl PageSource for HttpSource {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Value>, FetchError> {
        let response = self.get(&[("limit", limit), ("offset", offset)]).await?;
        let body: Value = response.json().await?;

        match body {
            Value::Array(records) => {
                debug!(offset, limit, returned = records.len(), "Fetched page");
                Ok(records)
            },
            Value::Null => Ok(Vec::new()),
            other => Err(FetchError::payload(
                &self.url,
                format!("expected a JSON array, got {}", json_kind(&other)),
            )),
        }
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[async_trait]
impl DocumentSource for HttpSource {
    async fn fetch_document(&self) -> Result<Vec<u8>, FetchError> {
        let response = self.get(&[]).await?;
        let bytes = response.bytes().await?.to_vec();
        debug!(url = %self.url, bytes = bytes.len(), "Downloaded document");
        Ok(bytes)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
