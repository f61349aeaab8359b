use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity types synced into the content store. Each is its own id namespace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Character,
    Corporation,
    Blueprint,
    Planet,
    Contract,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Character,
        EntityType::Corporation,
        EntityType::Blueprint,
        EntityType::Planet,
        EntityType::Contract,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Character => "character",
            EntityType::Corporation => "corporation",
            EntityType::Blueprint => "blueprint",
            EntityType::Planet => "planet",
            EntityType::Contract => "contract",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "character" => Some(EntityType::Character),
            "corporation" => Some(EntityType::Corporation),
            "blueprint" => Some(EntityType::Blueprint),
            "planet" => Some(EntityType::Planet),
            "contract" => Some(EntityType::Contract),
            _ => None,
        }
    }

    /// Reference data may be served from the response cache; volatile state may not.
    pub fn is_cache_eligible(&self) -> bool {
        matches!(self, EntityType::Character | EntityType::Corporation)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synced account, identified by its character id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SourceId(pub i64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-record outcome of one upsert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Skipped,
}

/// A record that could not be synced, with enough context to re-run it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordFailure {
    /// `None` when the record failed validation before an id could be read.
    pub external_id: Option<i64>,
    /// Position in fetch order.
    pub index: usize,
    pub reason: String,
}

/// Result of syncing one entity type for one source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReport {
    pub entity_type: EntityType,
    pub source: SourceId,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<RecordFailure>,
    /// Set when the whole entity sync failed (fetch, auth, breaker).
    pub error: Option<String>,
    pub from_cache: bool,
}

impl SyncReport {
    pub fn new(entity_type: EntityType, source: SourceId) -> Self {
        Self {
            entity_type,
            source,
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
            error: None,
            from_cache: false,
        }
    }

    pub fn failed_with(entity_type: EntityType, source: SourceId, reason: String) -> Self {
        let mut report = Self::new(entity_type, source);
        report.error = Some(reason);
        report
    }

    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn record_failure(&mut self, index: usize, external_id: Option<i64>, reason: String) {
        self.failed += 1;
        self.failures.push(RecordFailure {
            external_id,
            index,
            reason,
        });
    }

    pub fn succeeded(&self) -> usize {
        self.created + self.updated + self.skipped
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_round_trips_through_str() {
        for entity in EntityType::ALL {
            assert_eq!(EntityType::parse(entity.as_str()), Some(entity));
        }
        assert_eq!(EntityType::parse("skill"), None);
    }

    #[test]
    fn only_reference_data_is_cache_eligible() {
        assert!(EntityType::Corporation.is_cache_eligible());
        assert!(!EntityType::Contract.is_cache_eligible());
        assert!(!EntityType::Planet.is_cache_eligible());
    }

    #[test]
    fn report_counts_outcomes() {
        let mut report = SyncReport::new(EntityType::Blueprint, SourceId(7));
        report.record(UpsertOutcome::Created);
        report.record(UpsertOutcome::Skipped);
        report.record_failure(2, Some(11), "bad".into());
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].index, 2);
        assert!(!report.is_failed());
    }
}
