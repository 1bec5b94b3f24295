//! Source parsers
//!
//! Each parser turns one source's raw payload into [`ParsedRecord`]s with the same
//! shape: a string id plus a map of typed fields. A single malformed record is never
//! fatal; it is reported in [`ParseReport::rejections`] and parsing continues.

pub mod catalog;
pub mod enrichment;
pub mod identity;

use prodsync_common::WireRecord;
use serde::Serialize;
use tracing::warn;

use crate::stats::RunStatistics;

pub use catalog::parse_catalog;
pub use enrichment::{parse_event, parse_events};
pub use identity::{parse_identity_page, parse_identity_payload};

/// One normalized record from any source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedRecord {
    pub id: String,
    /// Content fields, subject to precedence
    pub fields: WireRecord,
    /// Event metadata; always overwritten, never compared by rank
    pub provenance: WireRecord,
}

impl ParsedRecord {
    pub fn new(id: impl Into<String>, fields: WireRecord) -> Self {
        Self {
            id: id.into(),
            fields,
            provenance: WireRecord::new(),
        }
    }
}

/// A record that failed validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseRejection {
    /// Position of the record in its payload
    pub index: usize,
    pub id: Option<String>,
    pub reason: String,
}

impl ParseRejection {
    pub fn new(index: usize, id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            index,
            id,
            reason: reason.into(),
        }
    }
}

/// Accepted records and rejections from one payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseReport {
    pub records: Vec<ParsedRecord>,
    pub rejections: Vec<ParseRejection>,
}

impl ParseReport {
    pub fn accept(&mut self, record: ParsedRecord) {
        self.records.push(record);
    }

    pub fn reject(&mut self, rejection: ParseRejection) {
        warn!(
            source_index = rejection.index,
            record_id = rejection.id.as_deref().unwrap_or("<none>"),
            reason = %rejection.reason,
            "Rejected record"
        );
        self.rejections.push(rejection);
    }

    pub fn extend(&mut self, other: ParseReport) {
        self.records.extend(other.records);
        self.rejections.extend(other.rejections);
    }

    pub fn statistics(&self) -> RunStatistics {
        RunStatistics {
            records_parsed: self.records.len() as u64,
            records_rejected: self.rejections.len() as u64,
            ..Default::default()
        }
    }
}
