use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregationFailure, Balances, EntityId, PartitionId, UtcDateTime};

/// Where a partition's value in a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    Live,
    /// Substituted from the snapshot taken at `snapshot_at`.
    Fallback { snapshot_at: UtcDateTime },
    Omitted,
}

impl Provenance {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Fallback { .. } => "fallback",
            Self::Omitted => "omitted",
        }
    }
}

/// Persisted, immutable aggregate for one entity at one point in time.
///
/// Keyed in stores by `(entity_id, bucket_start)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_id: EntityId,
    pub timestamp: UtcDateTime,
    pub bucket_start: i64,
    pub computed_at: UtcDateTime,
    pub run_id: Uuid,
    pub total_usd: f64,
    pub per_partition_usd: BTreeMap<PartitionId, f64>,
    pub per_asset_balances: BTreeMap<PartitionId, Balances>,
    pub per_asset_usd_balances: BTreeMap<PartitionId, Balances>,
    pub provenance: BTreeMap<PartitionId, Provenance>,
}

impl Snapshot {
    /// The time a partition's value was actually observed live.
    ///
    /// For a partition that was itself carried over from an older snapshot,
    /// this is the older snapshot's time rather than this snapshot's.
    pub fn observed_at(&self, partition: &PartitionId) -> Option<UtcDateTime> {
        match self.provenance.get(partition) {
            Some(Provenance::Omitted) => None,
            Some(Provenance::Fallback { snapshot_at }) => Some(*snapshot_at),
            Some(Provenance::Live) | None => self
                .per_partition_usd
                .contains_key(partition)
                .then_some(self.timestamp),
        }
    }
}

/// One unresolved partition and why it could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub partition: PartitionId,
    pub reason: String,
}

/// Structured record of a run that did not produce a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub run_id: Uuid,
    pub entity_id: EntityId,
    pub timestamp: UtcDateTime,
    pub recorded_at: UtcDateTime,
    pub kind: AggregationFailure,
    pub diagnostics: Vec<Diagnostic>,
}
