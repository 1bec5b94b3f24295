//! Minimal-identity parser for the paginated API
//!
//! Input is a flat list of objects. `id` is required (string or number); everything
//! else is optional. The source is flat, so nested values are dropped, and event
//! provenance keys are stripped since only the event feed may set them.

use prodsync_common::{normalize_id, WireRecord, ID_FIELD};
use serde_json::Value;
use tracing::warn;

use super::enrichment::PROVENANCE_FIELDS;
use super::{ParseRejection, ParseReport, ParsedRecord};
use crate::error::ParseError;
use crate::sources::http::json_kind;

/// Alternate spelling of the identity key used by some feeds
pub const ID_ALIAS: &str = "objectID";

/// Parse one fetched page. `first_index` is the position of `records[0]` in the whole
/// dataset, so rejections point at the right record across pages.
pub fn parse_identity_page(records: &[Value], first_index: usize) -> ParseReport {
    let mut report = ParseReport::default();

    for (i, raw) in records.iter().enumerate() {
        let index = first_index + i;
        match parse_record(raw) {
            Ok(record) => report.accept(record),
            Err(reason) => report.reject(ParseRejection::new(index, None, reason)),
        }
    }

    report
}

/// Parse a whole payload holding a JSON array
pub fn parse_identity_payload(bytes: &[u8]) -> Result<ParseReport, ParseError> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Array(records) => Ok(parse_identity_page(&records, 0)),
        other => Err(ParseError::Shape {
            expected: "a JSON array",
            found: json_kind(&other).to_string(),
        }),
    }
}

fn parse_record(raw: &Value) -> Result<ParsedRecord, String> {
    let object = raw
        .as_object()
        .ok_or_else(|| format!("expected an object, got {}", json_kind(raw)))?;

    let id = object
        .get(ID_FIELD)
        .or_else(|| object.get(ID_ALIAS))
        .and_then(normalize_id)
        .ok_or_else(|| "missing or invalid id".to_string())?;

    let mut fields = WireRecord::new();
    for (name, value) in object {
        if name == ID_FIELD || name == ID_ALIAS {
            continue;
        }
        if PROVENANCE_FIELDS.contains(&name.as_str()) {
            warn!(record_id = %id, field = %name, "Dropping event provenance from identity record");
            continue;
        }
        if value.is_object() || value.is_array() {
            warn!(record_id = %id, field = %name, "Dropping nested value from flat source");
            continue;
        }
        fields.insert(name.clone(), value.clone());
    }

    Ok(ParsedRecord::new(id, fields))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_and_string_ids() {
        let page = vec![
            json!({ "id": 1696302, "sku": "SKU-1" }),
            json!({ "id": "1696303" }),
            json!({ "objectID": "1696304", "name": "Alias" }),
        ];
        let report = parse_identity_page(&page, 0);

        assert!(report.rejections.is_empty());
        let ids: Vec<_> = report.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1696302", "1696303", "1696304"]);
        assert_eq!(report.records[0].fields["sku"], "SKU-1");
        assert!(!report.records[0].fields.contains_key("id"));
        assert!(!report.records[2].fields.contains_key("objectID"));
    }

    #[test]
    fn test_missing_id_rejected_not_fatal() {
        let page = vec![json!({ "name": "no id" }), json!({ "id": "7" }), json!("bare")];
        let report = parse_identity_page(&page, 1000);

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.rejections.len(), 2);
        assert_eq!(report.rejections[0].index, 1000);
        assert_eq!(report.rejections[1].index, 1002);
        assert_eq!(report.statistics().records_rejected, 2);
    }

    #[test]
    fn test_nested_values_dropped() {
        let page = vec![json!({ "id": "1", "tags": ["a"], "meta": { "x": 1 }, "brand": "Acme" })];
        let report = parse_identity_page(&page, 0);
        let fields = &report.records[0].fields;

        assert_eq!(fields.len(), 1);
        assert_eq!(fields["brand"], "Acme");
    }

    #[test]
    fn test_payload_must_be_array() {
        assert_eq!(parse_identity_payload(b"[]").unwrap().records.len(), 0);
        assert!(matches!(
            parse_identity_payload(br#"{"id": 1}"#),
            Err(ParseError::Shape { .. })
        ));
        assert!(matches!(parse_identity_payload(b"not json"), Err(ParseError::Json(_))));
    }

    #[test]
    fn test_provenance_keys_are_stripped() {
        let page = vec![json!({ "id": "1", "_event_offset": 0, "_processed_at": "x", "sku": "S" })];
        let report = parse_identity_page(&page, 0);

        let record = &report.records[0];
        assert_eq!(record.fields.len(), 1);
        assert_eq!(record.fields["sku"], "S");
        assert!(record.provenance.is_empty());
    }
}
