//! In-memory sink for dry runs and tests

use async_trait::async_trait;
use prodsync_common::WireRecord;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Batch, IndexSink, TaskHandle};
use crate::error::SinkError;

#[derive(Debug, Default)]
struct MemoryState {
    batches: Vec<Vec<WireRecord>>,
    awaited: Vec<usize>,
    failures_left: usize,
}

/// Keeps every submitted batch in memory.
///
/// Failures can be scripted: [`fail_on_batch`](Self::fail_on_batch) rejects the batch
/// at one index of every upload, [`fail_times`](Self::fail_times) rejects the first
/// `n` submissions, and [`never_complete`](Self::never_complete) makes completion waits
/// hang so callers' timeouts fire.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
    fail_on_batch: Option<usize>,
    never_complete: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on_batch(mut self, index: usize) -> Self {
        self.fail_on_batch = Some(index);
        self
    }

    pub fn fail_times(self, n: usize) -> Self {
        self.lock().failures_left = n;
        self
    }

    pub fn never_complete(mut self) -> Self {
        self.never_complete = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sizes of submitted batches, in submission order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batches.iter().map(Vec::len).collect()
    }

    pub fn batches(&self) -> Vec<Vec<WireRecord>> {
        self.lock().batches.clone()
    }

    /// Every record submitted so far, flattened
    pub fn records(&self) -> Vec<WireRecord> {
        self.lock().batches.iter().flatten().cloned().collect()
    }

    /// Indexes of batches whose completion was awaited
    pub fn awaited(&self) -> Vec<usize> {
        self.lock().awaited.clone()
    }
}

#[async_trait]
impl IndexSink for MemorySink {
    async fn submit(&self, batch: Batch<'_>) -> Result<TaskHandle, SinkError> {
        let mut state = self.lock();
        let scripted = state.failures_left > 0;
        if scripted {
            state.failures_left -= 1;
        }
        if scripted || self.fail_on_batch == Some(batch.index) {
            return Err(SinkError::Rejected {
                batch_index: batch.index,
                reason: "scripted failure".to_string(),
            });
        }

        state.batches.push(batch.records.to_vec());
        Ok(TaskHandle {
            batch_index: batch.index,
            task_id: state.batches.len() as u64,
        })
    }

    async fn await_completion(&self, handle: &TaskHandle) -> Result<(), SinkError> {
        if self.never_complete {
            std::future::pending::<()>().await;
        }
        self.lock().awaited.push(handle.batch_index);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
