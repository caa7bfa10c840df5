//! Shared fixtures for the behaviour tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chainvalue_core::source::BoxFuture;
use chainvalue_core::{
    AssetId, Balances, EngineConfig, Entity, EntityId, FailureRecord, FetchError, FixedPriceSource,
    PartitionId, PartitionSource, Provenance, Snapshot, SnapshotStore, StoreError, UnitPrice,
    UtcDateTime, WriteDisposition,
};
use uuid::Uuid;

pub const NOW: i64 = 1_700_000_000;

pub fn pid(value: &str) -> PartitionId {
    PartitionId::parse(value).expect("valid partition")
}

pub fn asset(value: &str) -> AssetId {
    AssetId::parse(value).expect("valid asset")
}

pub fn ts(unix: i64) -> UtcDateTime {
    UtcDateTime::from_unix(unix).expect("timestamp in range")
}

pub fn now() -> UtcDateTime {
    ts(NOW)
}

pub fn entity(partitions: &[&str]) -> Entity {
    Entity::new(
        EntityId::parse("ledgity").expect("valid entity id"),
        "Ledgity",
        partitions.iter().map(|partition| pid(partition)).collect(),
    )
    .expect("valid entity")
}

pub fn usdc(amount: f64) -> Balances {
    let mut balances = Balances::new();
    balances.insert(asset("usdc"), amount);
    balances
}

pub fn usd_prices() -> FixedPriceSource {
    FixedPriceSource::new().with_price(asset("usdc"), UnitPrice::usd(1.0))
}

/// Config with no backoff waits and short timeouts.
pub fn fast_config(max_retries: u32) -> EngineConfig {
    EngineConfig {
        max_retries,
        backoff_base_ms: 0,
        timeout_per_attempt_ms: 1_000,
        ..EngineConfig::default()
    }
}

/// A previously persisted snapshot with live values for every partition given.
pub fn prior_snapshot(at: UtcDateTime, values: &[(&str, f64)]) -> Snapshot {
    let mut per_partition_usd = BTreeMap::new();
    let mut per_asset_balances = BTreeMap::new();
    let mut per_asset_usd_balances = BTreeMap::new();
    let mut provenance = BTreeMap::new();
    for (partition, value) in values {
        per_partition_usd.insert(pid(partition), *value);
        per_asset_balances.insert(pid(partition), usdc(*value));
        per_asset_usd_balances.insert(pid(partition), usdc(*value));
        provenance.insert(pid(partition), Provenance::Live);
    }

    Snapshot {
        entity_id: EntityId::parse("ledgity").expect("valid entity id"),
        timestamp: at,
        bucket_start: at.floor_to(3600),
        computed_at: at,
        run_id: Uuid::new_v4(),
        total_usd: values.iter().map(|(_, value)| value).sum(),
        per_partition_usd,
        per_asset_balances,
        per_asset_usd_balances,
        provenance,
    }
}

/// One scripted adapter answer.
#[derive(Debug, Clone)]
pub enum Step {
    Ok(Balances),
    Err(FetchError),
    /// Sleeps before answering.
    Slow(Duration, Box<Step>),
}

/// Adapter that plays a per-partition script. The last step repeats forever.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<PartitionId, VecDeque<Step>>>,
    calls: Mutex<HashMap<PartitionId, u32>>,
    completed: AtomicU32,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, partition: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .expect("script lock")
            .insert(pid(partition), steps.into());
        self
    }

    pub fn calls_for(&self, partition: &str) -> u32 {
        self.calls
            .lock()
            .expect("call lock")
            .get(&pid(partition))
            .copied()
            .unwrap_or(0)
    }

    /// Calls that ran to completion, including slow ones.
    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }

    fn next_step(&self, partition: &PartitionId) -> Step {
        *self
            .calls
            .lock()
            .expect("call lock")
            .entry(partition.clone())
            .or_insert(0) += 1;

        let mut scripts = self.scripts.lock().expect("script lock");
        let Some(script) = scripts.get_mut(partition) else {
            return Step::Err(FetchError::malformed("no script for partition"));
        };
        if script.len() > 1 {
            script.pop_front().expect("non-empty script")
        } else {
            script
                .front()
                .cloned()
                .unwrap_or_else(|| Step::Err(FetchError::malformed("empty script")))
        }
    }
}

impl PartitionSource for ScriptedSource {
    fn fetch<'a>(
        &'a self,
        partition: &'a PartitionId,
        _at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Balances, FetchError>> {
        Box::pin(async move {
            let mut step = self.next_step(partition);
            let answer = loop {
                match step {
                    Step::Ok(balances) => break Ok(balances),
                    Step::Err(error) => break Err(error),
                    Step::Slow(delay, inner) => {
                        tokio::time::sleep(delay).await;
                        step = *inner;
                    }
                }
            };
            self.completed.fetch_add(1, Ordering::SeqCst);
            answer
        })
    }
}

/// Store whose operations can be switched to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: chainvalue_core::MemoryStore,
    pub fail_lookups: bool,
    pub fail_writes: bool,
}

impl SnapshotStore for FlakyStore {
    fn latest_at_or_before<'a>(
        &'a self,
        entity: &'a EntityId,
        at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Option<Snapshot>, StoreError>> {
        if self.fail_lookups {
            return Box::pin(async { Err(StoreError::Unavailable(String::from("disk on fire"))) });
        }
        self.inner.latest_at_or_before(entity, at)
    }

    fn latest_with_partition_at_or_before<'a>(
        &'a self,
        entity: &'a EntityId,
        partition: &'a PartitionId,
        at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Option<Snapshot>, StoreError>> {
        if self.fail_lookups {
            return Box::pin(async { Err(StoreError::Unavailable(String::from("disk on fire"))) });
        }
        self.inner.latest_with_partition_at_or_before(entity, partition, at)
    }

    fn upsert<'a>(
        &'a self,
        snapshot: &'a Snapshot,
    ) -> BoxFuture<'a, Result<WriteDisposition, StoreError>> {
        if self.fail_writes {
            return Box::pin(async { Err(StoreError::Backend(String::from("read-only volume"))) });
        }
        self.inner.upsert(snapshot)
    }

    fn record_failure<'a>(
        &'a self,
        record: &'a FailureRecord,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        if self.fail_writes {
            return Box::pin(async { Err(StoreError::Backend(String::from("read-only volume"))) });
        }
        self.inner.record_failure(record)
    }
}
