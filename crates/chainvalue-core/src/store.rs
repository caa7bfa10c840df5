//! Snapshot persistence contract and an in-memory implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::source::BoxFuture;
use crate::{EntityId, FailureRecord, PartitionId, Snapshot, StoreError, UtcDateTime};

/// What an upsert did to the `(entity, bucket)` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    Inserted,
    Replaced,
    /// The slot already holds a snapshot computed later; it was kept.
    SupersededByNewer,
}

/// Decides a write into an occupied slot. Last writer by `computed_at` wins;
/// ties go to the incoming snapshot.
pub fn resolve_write(existing: Option<&Snapshot>, incoming: &Snapshot) -> WriteDisposition {
    match existing {
        None => WriteDisposition::Inserted,
        Some(current) if current.computed_at > incoming.computed_at => {
            WriteDisposition::SupersededByNewer
        }
        Some(_) => WriteDisposition::Replaced,
    }
}

/// Key-value persistence of snapshots and failure records.
///
/// Snapshots are keyed by `(entity_id, bucket_start)`.
pub trait SnapshotStore: Send + Sync {
    /// Most recent snapshot of `entity` whose timestamp is at or before `at`.
    fn latest_at_or_before<'a>(
        &'a self,
        entity: &'a EntityId,
        at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Option<Snapshot>, StoreError>>;

    /// Most recent snapshot of `entity` at or before `at` that holds a value for
    /// `partition`. Snapshots where the partition was omitted are skipped.
    fn latest_with_partition_at_or_before<'a>(
        &'a self,
        entity: &'a EntityId,
        partition: &'a PartitionId,
        at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Option<Snapshot>, StoreError>>;

    fn upsert<'a>(
        &'a self,
        snapshot: &'a Snapshot,
    ) -> BoxFuture<'a, Result<WriteDisposition, StoreError>>;

    fn record_failure<'a>(
        &'a self,
        record: &'a FailureRecord,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshots: BTreeMap<(EntityId, i64), Snapshot>,
    failures: Vec<FailureRecord>,
}

/// Thread-safe in-memory store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, entity: &EntityId, bucket_start: i64) -> Option<Snapshot> {
        let store = self.inner.read().await;
        store
            .snapshots
            .get(&(entity.clone(), bucket_start))
            .cloned()
    }

    pub async fn snapshots(&self, entity: &EntityId) -> Vec<Snapshot> {
        let store = self.inner.read().await;
        store
            .snapshots
            .iter()
            .filter(|((id, _), _)| id == entity)
            .map(|(_, snapshot)| snapshot.clone())
            .collect()
    }

    pub async fn failures(&self) -> Vec<FailureRecord> {
        self.inner.read().await.failures.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.snapshots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.snapshots.is_empty()
    }
}

impl SnapshotStore for MemoryStore {
    fn latest_at_or_before<'a>(
        &'a self,
        entity: &'a EntityId,
        at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Option<Snapshot>, StoreError>> {
        Box::pin(async move {
            let store = self.inner.read().await;
            Ok(store
                .snapshots
                .iter()
                .filter(|((id, _), snapshot)| id == entity && snapshot.timestamp <= at)
                .map(|(_, snapshot)| snapshot)
                .max_by_key(|snapshot| snapshot.timestamp)
                .cloned())
        })
    }

    fn latest_with_partition_at_or_before<'a>(
        &'a self,
        entity: &'a EntityId,
        partition: &'a PartitionId,
        at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Option<Snapshot>, StoreError>> {
        Box::pin(async move {
            let store = self.inner.read().await;
            Ok(store
                .snapshots
                .iter()
                .filter(|((id, _), snapshot)| {
                    id == entity
                        && snapshot.timestamp <= at
                        && snapshot.per_partition_usd.contains_key(partition)
                })
                .map(|(_, snapshot)| snapshot)
                .max_by_key(|snapshot| snapshot.timestamp)
                .cloned())
        })
    }

    fn upsert<'a>(
        &'a self,
        snapshot: &'a Snapshot,
    ) -> BoxFuture<'a, Result<WriteDisposition, StoreError>> {
        Box::pin(async move {
            let mut store = self.inner.write().await;
            let key = (snapshot.entity_id.clone(), snapshot.bucket_start);
            let disposition = resolve_write(store.snapshots.get(&key), snapshot);
            if disposition != WriteDisposition::SupersededByNewer {
                store.snapshots.insert(key, snapshot.clone());
            }
            Ok(disposition)
        })
    }

    fn record_failure<'a>(
        &'a self,
        record: &'a FailureRecord,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.inner.write().await.failures.push(record.clone());
            Ok(())
        })
    }
}
