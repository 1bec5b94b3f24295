//! Precedence-aware merge engine
//!
//! Holds the canonical record set and applies writes from every source under a fixed
//! trust order (`Catalog > Enrichment > Identity`):
//!
//! - a write lands if the field is absent or the incoming rank is >= the stored rank
//! - a lower-rank write to a present field is rejected and recorded as a [`Conflict`]
//! - equal rank always overwrites, so replaying a payload is idempotent
//! - a higher-rank empty or null value still wins; present-but-empty is a statement
//!
//! A few fields follow a fixed policy instead of the rank rule, see [`FieldPolicy`].
//!
//! The engine does no I/O and never blocks. State survives between runs through
//! [`MergeEngine::snapshot`] and [`MergeEngine::from_snapshot`].

use chrono::{DateTime, Utc};
use prodsync_common::{SourceRank, WireRecord, ID_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::parsers::enrichment::PROVENANCE_FIELDS;
use crate::parsers::ParsedRecord;
use crate::snapshot::MergeSnapshot;
use crate::stats::RunStatistics;

/// Fields only the identity source may set
pub const IDENTITY_ONLY_FIELDS: [&str; 1] = ["sku"];

/// How writes to a field are arbitrated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Higher or equal rank wins; lower rank only fills absent fields
    Ranked,
    /// Event metadata; every write lands
    Provenance,
    /// Accepted only from [`SourceRank::Identity`]
    IdentityOnly,
}

impl FieldPolicy {
    pub fn for_field(name: &str) -> Self {
        if PROVENANCE_FIELDS.contains(&name) {
            FieldPolicy::Provenance
        } else if IDENTITY_ONLY_FIELDS.contains(&name) {
            FieldPolicy::IdentityOnly
        } else {
            FieldPolicy::Ranked
        }
    }
}

/// A stored field value with the rank and time of its last write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub value: Value,
    pub rank: SourceRank,
    pub written_at: DateTime<Utc>,
}

/// The merged truth for one product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: String,
    pub fields: BTreeMap<String, FieldEntry>,
}

impl CanonicalRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldEntry> {
        self.fields.get(field)
    }

    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).map(|entry| &entry.value)
    }

    /// Wire shape: `{ "id": "<string>", <field>: <value>, ... }`
    pub fn to_wire(&self) -> WireRecord {
        let mut wire = WireRecord::new();
        wire.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        for (name, entry) in &self.fields {
            wire.insert(name.clone(), entry.value.clone());
        }
        wire
    }
}

/// Why a write was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// The stored value came from a higher-ranked source
    LowerRank,
    /// The field's policy does not accept writes from this rank
    RankNotPermitted,
}

/// A rejected write. Observational only; never changes a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub field: String,
    pub incoming_value: Value,
    pub incoming_rank: SourceRank,
    /// `None` when the field was absent and the rank was not permitted
    pub kept_value: Option<Value>,
    pub kept_rank: Option<SourceRank>,
    pub timestamp: DateTime<Utc>,
    pub reason: ConflictReason,
}

/// What one `apply` call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub created: bool,
    pub written: u64,
    pub unchanged: u64,
    pub provenance: u64,
    pub conflicts: u64,
}

impl MergeOutcome {
    fn absorb(&mut self, other: MergeOutcome) {
        self.created |= other.created;
        self.written += other.written;
        self.unchanged += other.unchanged;
        self.provenance += other.provenance;
        self.conflicts += other.conflicts;
    }

    pub fn statistics(&self) -> RunStatistics {
        RunStatistics {
            records_created: u64::from(self.created),
            fields_written: self.written,
            fields_unchanged: self.unchanged,
            provenance_writes: self.provenance,
            conflicts: self.conflicts,
            ..Default::default()
        }
    }
}

enum Decision {
    Write,
    Unchanged,
    Reject(ConflictReason),
}

fn decide(
    policy: FieldPolicy,
    stored: Option<&FieldEntry>,
    incoming: &Value,
    rank: SourceRank,
) -> Decision {
    match policy {
        FieldPolicy::Provenance => return Decision::Write,
        FieldPolicy::IdentityOnly if rank != SourceRank::Identity => {
            return Decision::Reject(ConflictReason::RankNotPermitted)
        },
        _ => {},
    }

    // A stored null counts as present, so lower ranks never fill a catalog null
    match stored {
        None => Decision::Write,
        Some(entry) if rank > entry.rank => Decision::Write,
        Some(entry) if rank == entry.rank && entry.value == *incoming => Decision::Unchanged,
        Some(entry) if rank == entry.rank => Decision::Write,
        Some(_) => Decision::Reject(ConflictReason::LowerRank),
    }
}

/// Canonical record set plus the conflict log
#[derive(Debug, Default)]
pub struct MergeEngine {
    records: BTreeMap<String, CanonicalRecord>,
    conflicts: Vec<Conflict>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `fields` from a source of `rank` to record `id`, stamped with the
    /// current time
    pub fn apply(&mut self, id: &str, fields: &WireRecord, rank: SourceRank) -> MergeOutcome {
        self.apply_at(id, fields, rank, Utc::now())
    }

    /// [`apply`](Self::apply) with an explicit write time
    pub fn apply_at(
        &mut self,
        id: &str,
        fields: &WireRecord,
        rank: SourceRank,
        at: DateTime<Utc>,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        if !self.records.contains_key(id) {
            outcome.created = true;
            debug!(record_id = id, rank = %rank, "Creating canonical record");
        }
        let record = self
            .records
            .entry(id.to_string())
            .or_insert_with(|| CanonicalRecord::new(id));

        for (name, incoming) in fields {
            if name == ID_FIELD {
                continue;
            }
            let policy = FieldPolicy::for_field(name);

            match decide(policy, record.fields.get(name), incoming, rank) {
                Decision::Write => {
                    record.fields.insert(
                        name.clone(),
                        FieldEntry {
                            value: incoming.clone(),
                            rank,
                            written_at: at,
                        },
                    );
                    if policy == FieldPolicy::Provenance {
                        outcome.provenance += 1;
                    } else {
                        outcome.written += 1;
                    }
                },
                Decision::Unchanged => outcome.unchanged += 1,
                Decision::Reject(reason) => {
                    let kept = record.fields.get(name);
                    debug!(
                        record_id = id,
                        field = %name,
                        incoming_rank = %rank,
                        kept_rank = kept.map(|k| k.rank.as_str()).unwrap_or("none"),
                        ?reason,
                        "Write rejected by precedence"
                    );
                    self.conflicts.push(Conflict {
                        id: id.to_string(),
                        field: name.clone(),
                        incoming_value: incoming.clone(),
                        incoming_rank: rank,
                        kept_value: kept.map(|k| k.value.clone()),
                        kept_rank: kept.map(|k| k.rank),
                        timestamp: at,
                        reason,
                    });
                    outcome.conflicts += 1;
                },
            }
        }

        outcome
    }

    /// Apply a parsed record: content fields under `rank`, then its provenance
    pub fn apply_parsed(&mut self, record: &ParsedRecord, rank: SourceRank) -> MergeOutcome {
        let at = Utc::now();
        let mut outcome = self.apply_at(&record.id, &record.fields, rank, at);
        if !record.provenance.is_empty() {
            outcome.absorb(self.apply_at(&record.id, &record.provenance, rank, at));
        }
        outcome
    }

    /// Apply every record and return the combined statistics
    pub fn apply_all<'a, I>(&mut self, records: I, rank: SourceRank) -> RunStatistics
    where
        I: IntoIterator<Item = &'a ParsedRecord>,
    {
        let mut total = MergeOutcome::default();
        let mut created = 0;
        for record in records {
            let outcome = self.apply_parsed(record, rank);
            created += u64::from(outcome.created);
            total.absorb(outcome);
        }
        let mut stats = total.statistics();
        stats.records_created = created;
        stats
    }

    pub fn record(&self, id: &str) -> Option<&CanonicalRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &CanonicalRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    pub fn conflicts_for<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Conflict> + 'a {
        self.conflicts.iter().filter(move |c| c.id == id)
    }

    /// Take the conflict log, leaving it empty
    pub fn drain_conflicts(&mut self) -> Vec<Conflict> {
        std::mem::take(&mut self.conflicts)
    }

    /// Every record in wire shape, ordered by id
    pub fn canonical_records(&self) -> Vec<WireRecord> {
        self.records.values().map(CanonicalRecord::to_wire).collect()
    }

    /// Wire shape for the given ids, in the order given; unknown ids are skipped
    pub fn canonical_records_for<'a, I>(&self, ids: I) -> Vec<WireRecord>
    where
        I: IntoIterator<Item = &'a String>,
    {
        ids.into_iter()
            .filter_map(|id| self.records.get(id))
            .map(CanonicalRecord::to_wire)
            .collect()
    }

    /// Capture the record set. Conflicts belong to a run and are not included.
    pub fn snapshot(&self) -> MergeSnapshot {
        MergeSnapshot::new(self.records.values().cloned().collect())
    }

    /// Rebuild an engine from a previous run's snapshot
    pub fn from_snapshot(snapshot: MergeSnapshot) -> Self {
        let records = snapshot
            .records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Self {
            records,
            conflicts: Vec::new(),
        }
    }
}
