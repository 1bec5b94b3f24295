//! Run statistics
//!
//! Each component returns its own partial [`RunStatistics`]; the orchestrator merges
//! them with `+=` and reports the total at the end of the run.

use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use tracing::info;

/// Counters for one sync or consume run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub pages_fetched: u64,
    pub fetch_retries: u64,
    pub records_fetched: u64,
    pub records_parsed: u64,
    pub records_rejected: u64,
    pub records_created: u64,
    pub fields_written: u64,
    /// Equal-rank writes that carried the value already stored
    pub fields_unchanged: u64,
    pub conflicts: u64,
    pub provenance_writes: u64,
    pub events_consumed: u64,
    pub batches_submitted: u64,
    pub batches_completed: u64,
    pub records_uploaded: u64,
    pub upload_failures: u64,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, other: &RunStatistics) {
        self.pages_fetched += other.pages_fetched;
        self.fetch_retries += other.fetch_retries;
        self.records_fetched += other.records_fetched;
        self.records_parsed += other.records_parsed;
        self.records_rejected += other.records_rejected;
        self.records_created += other.records_created;
        self.fields_written += other.fields_written;
        self.fields_unchanged += other.fields_unchanged;
        self.conflicts += other.conflicts;
        self.provenance_writes += other.provenance_writes;
        self.events_consumed += other.events_consumed;
        self.batches_submitted += other.batches_submitted;
        self.batches_completed += other.batches_completed;
        self.records_uploaded += other.records_uploaded;
        self.upload_failures += other.upload_failures;
    }

    /// True when nothing was rejected and every upload went through
    pub fn is_clean(&self) -> bool {
        self.records_rejected == 0 && self.upload_failures == 0
    }

    /// Emit the run summary as a single structured event
    pub fn log_summary(&self) {
        info!(
            pages_fetched = self.pages_fetched,
            fetch_retries = self.fetch_retries,
            records_fetched = self.records_fetched,
            records_parsed = self.records_parsed,
            records_rejected = self.records_rejected,
            records_created = self.records_created,
            fields_written = self.fields_written,
            fields_unchanged = self.fields_unchanged,
            conflicts = self.conflicts,
            provenance_writes = self.provenance_writes,
            events_consumed = self.events_consumed,
            batches_submitted = self.batches_submitted,
            batches_completed = self.batches_completed,
            records_uploaded = self.records_uploaded,
            upload_failures = self.upload_failures,
            "Run summary"
        );
    }
}

impl AddAssign<&RunStatistics> for RunStatistics {
    fn add_assign(&mut self, other: &RunStatistics) {
        self.merge(other);
    }
}

impl AddAssign for RunStatistics {
    fn add_assign(&mut self, other: RunStatistics) {
        self.merge(&other);
    }
}
