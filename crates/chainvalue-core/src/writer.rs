//! Committing successful aggregates and recording failed ones.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    AggregateOutcome, AggregationFailure, FailureRecord, PersistenceError, Provenance, Snapshot,
    SnapshotStore, UtcDateTime, WriteDisposition,
};

/// A committed snapshot and what the store did with it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedSnapshot {
    pub snapshot: Snapshot,
    pub disposition: WriteDisposition,
}

#[derive(Clone)]
pub struct SnapshotWriter {
    store: Arc<dyn SnapshotStore>,
    bucket_seconds: u64,
}

impl SnapshotWriter {
    pub fn new(store: Arc<dyn SnapshotStore>, bucket_seconds: u64) -> Self {
        Self {
            store,
            bucket_seconds: bucket_seconds.max(1),
        }
    }

    /// Builds the snapshot for a successful outcome without persisting it.
    pub fn snapshot_of(&self, outcome: &AggregateOutcome, run_id: Uuid) -> Snapshot {
        let mut per_partition_usd = BTreeMap::new();
        let mut per_asset_balances = BTreeMap::new();
        let mut per_asset_usd_balances = BTreeMap::new();
        let mut provenance = BTreeMap::new();

        for line in &outcome.lines {
            provenance.insert(line.partition.clone(), line.provenance);
            if let Some(value) = line.usd_value {
                per_partition_usd.insert(line.partition.clone(), value);
                per_asset_balances.insert(line.partition.clone(), line.balances.clone());
                per_asset_usd_balances.insert(line.partition.clone(), line.usd_balances.clone());
            }
        }

        Snapshot {
            entity_id: outcome.entity_id.clone(),
            timestamp: outcome.timestamp,
            bucket_start: outcome.timestamp.floor_to(self.bucket_seconds),
            computed_at: UtcDateTime::now(),
            run_id,
            total_usd: outcome.total_usd,
            per_partition_usd,
            per_asset_balances,
            per_asset_usd_balances,
            provenance,
        }
    }

    /// Persists a successful outcome. Re-committing the same bucket overwrites it.
    pub async fn commit(
        &self,
        outcome: &AggregateOutcome,
        run_id: Uuid,
    ) -> Result<PersistedSnapshot, PersistenceError> {
        if !outcome.success {
            return Err(PersistenceError::NotCommittable {
                entity: outcome.entity_id.to_string(),
            });
        }

        let snapshot = self.snapshot_of(outcome, run_id);
        let disposition = self.store.upsert(&snapshot).await?;

        let fallbacks = snapshot
            .provenance
            .values()
            .filter(|provenance| matches!(provenance, Provenance::Fallback { .. }))
            .count();
        info!(
            entity = %snapshot.entity_id,
            %run_id,
            bucket_start = snapshot.bucket_start,
            total_usd = snapshot.total_usd,
            fallbacks,
            ?disposition,
            "snapshot committed"
        );
        if disposition == WriteDisposition::SupersededByNewer {
            warn!(
                entity = %snapshot.entity_id,
                %run_id,
                "a newer snapshot already occupies this bucket; it was kept"
            );
        }

        Ok(PersistedSnapshot {
            snapshot,
            disposition,
        })
    }

    /// Records why a run produced no snapshot. Never fails; returns whether the record was stored.
    pub async fn report_failure(
        &self,
        outcome: &AggregateOutcome,
        kind: AggregationFailure,
        run_id: Uuid,
    ) -> bool {
        let record = FailureRecord {
            run_id,
            entity_id: outcome.entity_id.clone(),
            timestamp: outcome.timestamp,
            recorded_at: UtcDateTime::now(),
            kind,
            diagnostics: outcome.diagnostics.clone(),
        };

        for diagnostic in &record.diagnostics {
            warn!(
                entity = %record.entity_id,
                %run_id,
                partition = %diagnostic.partition,
                reason = %diagnostic.reason,
                "partition unresolved"
            );
        }

        match self.store.record_failure(&record).await {
            Ok(()) => {
                warn!(entity = %record.entity_id, %run_id, %kind, "run failed; failure recorded");
                true
            }
            Err(store_error) => {
                error!(
                    entity = %record.entity_id,
                    %run_id,
                    %kind,
                    error = %store_error,
                    "run failed and the failure record could not be stored"
                );
                false
            }
        }
    }
}
