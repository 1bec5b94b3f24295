//! Canonical types shared across prodsync

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Name of the identity key in every canonical record
pub const ID_FIELD: &str = "id";

/// A canonical record as it travels to the index: `{ "id": "...", <field>: <value>, ... }`
pub type WireRecord = serde_json::Map<String, Value>;

/// Fixed trust order among sources.
///
/// Declaration order is precedence order: `Identity < Enrichment < Catalog`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRank {
    /// Minimal-identity records from the paginated API
    Identity,
    /// Real-time enrichment events
    Enrichment,
    /// The authoritative bulk XML catalog
    Catalog,
}

impl SourceRank {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceRank::Identity => "identity",
            SourceRank::Enrichment => "enrichment",
            SourceRank::Catalog => "catalog",
        }
    }

    /// All ranks, lowest precedence first
    pub fn all() -> [SourceRank; 3] {
        [SourceRank::Identity, SourceRank::Enrichment, SourceRank::Catalog]
    }
}

impl std::fmt::Display for SourceRank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceRank {
    type Err = SyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "identity" | "minimal" => Ok(SourceRank::Identity),
            "enrichment" | "realtime" | "events" => Ok(SourceRank::Enrichment),
            "catalog" | "authoritative" => Ok(SourceRank::Catalog),
            _ => Err(SyncError::InvalidRank(s.to_string())),
        }
    }
}

/// Normalize a raw identifier into its canonical string form.
///
/// Sources disagree on whether `id` is a string or a number; the wire shape always
/// carries a string. Blank strings are not identifiers.
pub fn normalize_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        },
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rank_order() {
        assert!(SourceRank::Catalog > SourceRank::Enrichment);
        assert!(SourceRank::Enrichment > SourceRank::Identity);
        assert_eq!(SourceRank::all().iter().max(), Some(&SourceRank::Catalog));
    }

    #[test]
    fn test_rank_from_str() {
        assert_eq!("Catalog".parse::<SourceRank>().unwrap(), SourceRank::Catalog);
        assert_eq!("events".parse::<SourceRank>().unwrap(), SourceRank::Enrichment);
        assert_eq!("minimal".parse::<SourceRank>().unwrap(), SourceRank::Identity);
        assert!("vendor".parse::<SourceRank>().is_err());
    }

    #[test]
    fn test_rank_serde_lowercase() {
        assert_eq!(serde_json::to_string(&SourceRank::Enrichment).unwrap(), "\"enrichment\"");
        let rank: SourceRank = serde_json::from_str("\"catalog\"").unwrap();
        assert_eq!(rank, SourceRank::Catalog);
    }

    #[test]
    fn test_normalize_id() {
        assert_eq!(normalize_id(&json!("1696302")), Some("1696302".to_string()));
        assert_eq!(normalize_id(&json!(1696302)), Some("1696302".to_string()));
        assert_eq!(normalize_id(&json!("  42 ")), Some("42".to_string()));
        assert_eq!(normalize_id(&json!("")), None);
        assert_eq!(normalize_id(&json!(null)), None);
        assert_eq!(normalize_id(&json!({"id": 1})), None);
    }
}
