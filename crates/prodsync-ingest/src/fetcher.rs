//! Retrying paginated fetcher
//!
//! Walks a [`PageSource`] with `offset` advancing by `page_size` after every
//! successful page. Every request, retries included, first passes the shared
//! [`RateLimiter`]. A failed page is retried under the [`RetryPolicy`]; running out of
//! retries ends the fetch with [`FetchError::RetriesExhausted`].
//!
//! A page that is empty or shorter than `page_size` is the last one.
//!
//! The fetcher knows nothing about record semantics and yields raw JSON values.

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::FetchError;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::sources::{PageSource, MAX_PAGE_SIZE};
use crate::stats::RunStatistics;

/// Position in the paged dataset. Advances monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCursor {
    pub offset: usize,
    pub page_size: usize,
    pub page_number: usize,
}

impl FetchCursor {
    pub fn new(page_size: usize) -> Self {
        Self {
            offset: 0,
            page_size,
            page_number: 0,
        }
    }

    /// Cursor for the next page, or `None` if a page of `returned` records was the last
    pub fn advance(self, returned: usize) -> Option<FetchCursor> {
        if returned == 0 || returned < self.page_size {
            return None;
        }
        Some(FetchCursor {
            offset: self.offset + self.page_size,
            page_size: self.page_size,
            page_number: self.page_number + 1,
        })
    }
}

/// One successfully fetched page
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub cursor: FetchCursor,
    pub records: Vec<Value>,
    /// Retries needed before the page came back
    pub retries: u32,
}

pub struct PaginatedFetcher {
    source: Arc<dyn PageSource>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    page_size: usize,
}

impl PaginatedFetcher {
    /// `page_size` is clamped to `1..=MAX_PAGE_SIZE`
    pub fn new(
        source: Arc<dyn PageSource>,
        limiter: RateLimiter,
        retry: RetryPolicy,
        page_size: usize,
    ) -> Self {
        Self {
            source,
            limiter,
            retry,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_page(&self, cursor: FetchCursor) -> Result<Page, FetchError> {
        let offset = cursor.offset;
        let limit = cursor.page_size;

        let result = self
            .retry
            .run("fetch-page", move |_| async move {
                self.limiter.admit().await;
                self.source.fetch_page(offset, limit).await
            })
            .await;

        match result {
            Ok((records, retries)) => {
                debug!(
                    page = cursor.page_number,
                    offset,
                    returned = records.len(),
                    retries,
                    "Page fetched"
                );
                Ok(Page {
                    cursor,
                    records,
                    retries,
                })
            },
            Err(exhausted) => Err(FetchError::RetriesExhausted {
                offset,
                attempts: exhausted.attempts,
                last_error: Box::new(exhausted.last_error),
            }),
        }
    }

    /// Lazy stream of pages. Ends after the last page or after the first fatal error.
    pub fn fetch_pages(&self) -> impl Stream<Item = Result<Page, FetchError>> + Send + '_ {
        stream::unfold(Some(FetchCursor::new(self.page_size)), move |cursor| async move {
            let cursor = cursor?;
            match self.fetch_page(cursor).await {
                Ok(page) => {
                    let next = cursor.advance(page.records.len());
                    Some((Ok(page), next))
                },
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Lazy stream of raw records across all pages
    pub fn fetch_all(&self) -> impl Stream<Item = Result<Value, FetchError>> + Send + '_ {
        self.fetch_pages().flat_map(|page| {
            let items: Vec<Result<Value, FetchError>> = match page {
                Ok(page) => page.records.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
    }

    /// Drain every page, returning the pages with fetch statistics
    pub async fn fetch_all_pages(&self) -> Result<(Vec<Page>, RunStatistics), FetchError> {
        let mut pages = Vec::new();
        let mut stats = RunStatistics::new();
        let mut stream = std::pin::pin!(self.fetch_pages());

        while let Some(page) = stream.next().await {
            let page = page?;
            stats.pages_fetched += 1;
            stats.fetch_retries += u64::from(page.retries);
            stats.records_fetched += page.records.len() as u64;
            pages.push(page);
        }

        info!(
            source = %self.source.describe(),
            pages = stats.pages_fetched,
            records = stats.records_fetched,
            retries = stats.fetch_retries,
            "Paginated fetch complete"
        );
        Ok((pages, stats))
    }

    /// Drain every record into memory
    pub async fn fetch_all_collect(&self) -> Result<(Vec<Value>, RunStatistics), FetchError> {
        let (pages, stats) = self.fetch_all_pages().await?;
        let records = pages.into_iter().flat_map(|page| page.records).collect();
        Ok((records, stats))
    }
}
