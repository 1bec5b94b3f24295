//! HTTP search index sink
//!
//! Speaks a batch-and-task API:
//!
//! - `POST {base}/1/indexes/{index}/batch` with
//!   `{"requests":[{"action":"updateObject","body":{...}}]}` returns `{"taskID": n}`
//! - `GET {base}/1/indexes/{index}/task/{n}` returns `{"status": "published"}` once
//!   the batch is durable, `"notPublished"` before that
//!
//! Submissions are not retried here; a failed batch fails the upload. Task status
//! polls are retried with the shared [`RetryPolicy`] since they are read-only.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{Batch, IndexSink, TaskHandle};
use crate::error::SinkError;
use crate::retry::RetryPolicy;
use prodsync_common::WireRecord;

pub const APP_ID_HEADER: &str = "X-Index-Application-Id";
pub const API_KEY_HEADER: &str = "X-Index-API-Key";

/// Default pause between task status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    pub base_url: String,
    pub index_name: String,
    pub app_id: String,
    pub api_key: String,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    requests: Vec<BatchOperation<'a>>,
}

#[derive(Serialize)]
struct BatchOperation<'a> {
    action: &'static str,
    body: &'a WireRecord,
}

#[derive(Deserialize)]
struct BatchResponse {
    #[serde(rename = "taskID")]
    task_id: u64,
}

#[derive(Deserialize)]
struct TaskStatusResponse {
    status: String,
}

#[derive(Debug, Clone)]
pub struct HttpIndexSink {
    client: Client,
    config: HttpSinkConfig,
}

impl HttpIndexSink {
    pub fn new(client: Client, config: HttpSinkConfig) -> Self {
        Self { client, config }
    }

    fn batch_url(&self) -> String {
        format!(
            "{}/1/indexes/{}/batch",
            self.config.base_url.trim_end_matches('/'),
            self.config.index_name
        )
    }

    fn task_url(&self, task_id: u64) -> String {
        format!(
            "{}/1/indexes/{}/task/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.index_name,
            task_id
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(APP_ID_HEADER, &self.config.app_id)
            .header(API_KEY_HEADER, &self.config.api_key)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SinkError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn task_published(&self, task_id: u64) -> Result<bool, SinkError> {
        let response = self
            .authorized(self.client.get(self.task_url(task_id)))
            .send()
            .await?;
        let status: TaskStatusResponse = Self::check(response).await?.json().await?;
        Ok(status.status == "published")
    }
}

#[async_trait]
impl IndexSink for HttpIndexSink {
    async fn submit(&self, batch: Batch<'_>) -> Result<TaskHandle, SinkError> {
        let request = BatchRequest {
            requests: batch
                .records
                .iter()
                .map(|body| BatchOperation {
                    action: "updateObject",
                    body,
                })
                .collect(),
        };

        let response = self
            .authorized(self.client.post(self.batch_url()))
            .json(&request)
            .send()
            .await?;
        let accepted: BatchResponse = Self::check(response).await?.json().await?;

        info!(
            batch = batch.index,
            records = batch.len(),
            task_id = accepted.task_id,
            "Submitted batch"
        );
        Ok(TaskHandle {
            batch_index: batch.index,
            task_id: accepted.task_id,
        })
    }

    async fn await_completion(&self, handle: &TaskHandle) -> Result<(), SinkError> {
        loop {
            let (published, _) = self
                .config
                .retry
                .run("task-status", move |_| self.task_published(handle.task_id))
                .await
                .map_err(|exhausted| exhausted.last_error)?;

            if published {
                debug!(task_id = handle.task_id, batch = handle.batch_index, "Task published");
                return Ok(());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}
