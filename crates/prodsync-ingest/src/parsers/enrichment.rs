//! Enrichment event parser
//!
//! One event per call. The payload needs an `id` (or `objectID`); every other field
//! is optional. Event metadata is attached as provenance fields, which describe the
//! event itself and so always overwrite.

use chrono::{DateTime, SecondsFormat, Utc};
use prodsync_common::{normalize_id, WireRecord, ID_FIELD};
use serde_json::Value;

use super::identity::ID_ALIAS;
use super::{ParseRejection, ParseReport, ParsedRecord};
use crate::sources::http::json_kind;
use crate::sources::EnrichmentEvent;

pub const EVENT_TIMESTAMP_FIELD: &str = "_event_timestamp";
pub const EVENT_OFFSET_FIELD: &str = "_event_offset";
pub const EVENT_PARTITION_FIELD: &str = "_event_partition";
pub const PROCESSED_AT_FIELD: &str = "_processed_at";

/// Provenance field names written for every event
pub const PROVENANCE_FIELDS: [&str; 4] = [
    EVENT_TIMESTAMP_FIELD,
    EVENT_OFFSET_FIELD,
    EVENT_PARTITION_FIELD,
    PROCESSED_AT_FIELD,
];

/// Parse one event. `index` is only used to locate a rejection.
pub fn parse_event(
    event: &EnrichmentEvent,
    index: usize,
    processed_at: DateTime<Utc>,
) -> Result<ParsedRecord, ParseRejection> {
    let object = event.payload.as_object().ok_or_else(|| {
        ParseRejection::new(
            index,
            None,
            format!("expected an object payload, got {}", json_kind(&event.payload)),
        )
    })?;

    let id = object
        .get(ID_FIELD)
        .or_else(|| object.get(ID_ALIAS))
        .and_then(normalize_id)
        .ok_or_else(|| ParseRejection::new(index, None, "missing or invalid id"))?;

    let fields: WireRecord = object
        .iter()
        .filter(|(name, _)| name.as_str() != ID_FIELD && name.as_str() != ID_ALIAS)
        .filter(|(name, _)| !PROVENANCE_FIELDS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let mut provenance = WireRecord::new();
    provenance.insert(
        EVENT_TIMESTAMP_FIELD.to_string(),
        Value::from(event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    provenance.insert(EVENT_OFFSET_FIELD.to_string(), Value::from(event.offset));
    provenance.insert(EVENT_PARTITION_FIELD.to_string(), Value::from(event.partition));
    provenance.insert(
        PROCESSED_AT_FIELD.to_string(),
        Value::from(processed_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );

    Ok(ParsedRecord {
        id,
        fields,
        provenance,
    })
}

/// Parse a run of events into one report
pub fn parse_events(events: &[EnrichmentEvent], processed_at: DateTime<Utc>) -> ParseReport {
    let mut report = ParseReport::default();
    for (index, event) in events.iter().enumerate() {
        match parse_event(event, index, processed_at) {
            Ok(record) => report.accept(record),
            Err(rejection) => report.reject(rejection),
        }
    }
    report
}
