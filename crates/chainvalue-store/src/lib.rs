//! # chainvalue Store
//!
//! DuckDB-backed [`SnapshotStore`] for the chainvalue engine.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chainvalue_store::{DuckDbSnapshotStore, StoreConfig};
//!
//! fn main() -> Result<(), chainvalue_store::DuckStoreError> {
//!     let store = DuckDbSnapshotStore::open_default()?;
//!     println!("snapshots live in {:?}", store.db_path());
//!     Ok(())
//! }
//! ```
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `snapshots` | One committed snapshot per `(entity_id, bucket_start)` |
//! | `partition_values` | Per-partition value and provenance of each snapshot |
//! | `failure_log` | Runs that did not produce a snapshot |
//! | `schema_migrations` | Applied schema versions |
//!
//! All statements are parameterized. Snapshot writes are serialized through
//! one lock and run in a transaction, so the read-compare-write of
//! [`resolve_write`] is atomic.

pub mod migrations;
pub mod pool;

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ::duckdb::{Connection, ToSql};
use chainvalue_core::source::BoxFuture;
use chainvalue_core::store::resolve_write;
use chainvalue_core::{
    EntityId, FailureRecord, PartitionId, Snapshot, SnapshotStore, StoreError, UtcDateTime,
    WriteDisposition,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

pub use pool::{ConnectionPool, DbLocation, PooledConnection};

#[derive(Debug, Error)]
pub enum DuckStoreError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("stored payload is invalid: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("store task did not complete: {0}")]
    Task(String),
}

impl From<DuckStoreError> for StoreError {
    fn from(value: DuckStoreError) -> Self {
        match value {
            DuckStoreError::Payload(error) => Self::Serialization(error),
            DuckStoreError::Task(message) => Self::Unavailable(message),
            other => Self::Backend(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for chainvalue data.
    pub chainvalue_home: PathBuf,
    pub db_path: PathBuf,
    pub max_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let chainvalue_home = resolve_chainvalue_home();
        let db_path = chainvalue_home.join("snapshots.duckdb");
        Self {
            chainvalue_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

/// One partition's value in one stored snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionValueRow {
    pub bucket_start: i64,
    pub usd_value: Option<f64>,
    pub provenance: String,
    pub observed_at: Option<String>,
}

#[derive(Clone)]
pub struct DuckDbSnapshotStore {
    pool: ConnectionPool,
    write_lock: Arc<Mutex<()>>,
}

impl DuckDbSnapshotStore {
    pub fn open_default() -> Result<Self, DuckStoreError> {
        Self::open(StoreConfig::default())
    }

    pub fn open(config: StoreConfig) -> Result<Self, DuckStoreError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pool = ConnectionPool::open(DbLocation::File(config.db_path), config.max_pool_size)?;
        Self::with_pool(pool)
    }

    /// A throwaway database that lives as long as the store.
    pub fn open_in_memory() -> Result<Self, DuckStoreError> {
        Self::with_pool(ConnectionPool::open(DbLocation::InMemory, 2)?)
    }

    fn with_pool(pool: ConnectionPool) -> Result<Self, DuckStoreError> {
        let store = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn initialize(&self) -> Result<(), DuckStoreError> {
        let connection = self.pool.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.pool.db_path()
    }

    pub fn get(
        &self,
        entity: &EntityId,
        bucket_start: i64,
    ) -> Result<Option<Snapshot>, DuckStoreError> {
        let connection = self.pool.acquire()?;
        select_snapshot(&connection, entity, bucket_start)
    }

    pub fn latest_snapshot_at_or_before(
        &self,
        entity: &EntityId,
        at: UtcDateTime,
    ) -> Result<Option<Snapshot>, DuckStoreError> {
        let connection = self.pool.acquire()?;
        let params: [&dyn ToSql; 2] = [&entity.as_str(), &at.unix_timestamp()];
        let payloads = query_payloads(
            &connection,
            "SELECT payload FROM snapshots \
             WHERE entity_id = ? AND snapshot_ts <= ? \
             ORDER BY snapshot_ts DESC, bucket_start DESC LIMIT 1",
            &params,
        )?;
        payloads
            .first()
            .map(|payload| serde_json::from_str(payload))
            .transpose()
            .map_err(DuckStoreError::from)
    }

    /// Most recent snapshot at or before `at` in which `partition` has a value.
    pub fn latest_snapshot_with_partition(
        &self,
        entity: &EntityId,
        partition: &PartitionId,
        at: UtcDateTime,
    ) -> Result<Option<Snapshot>, DuckStoreError> {
        let connection = self.pool.acquire()?;
        let params: [&dyn ToSql; 3] = [&entity.as_str(), &partition.as_str(), &at.unix_timestamp()];
        let payloads = query_payloads(
            &connection,
            "SELECT s.payload FROM snapshots s \
             JOIN partition_values p \
               ON p.entity_id = s.entity_id AND p.bucket_start = s.bucket_start \
             WHERE s.entity_id = ? AND p.partition_id = ? AND p.usd_value IS NOT NULL \
               AND s.snapshot_ts <= ? \
             ORDER BY s.snapshot_ts DESC, s.bucket_start DESC LIMIT 1",
            &params,
        )?;
        payloads
            .first()
            .map(|payload| serde_json::from_str(payload))
            .transpose()
            .map_err(DuckStoreError::from)
    }

    /// Every stored snapshot of `entity`, oldest bucket first.
    pub fn list_snapshots(&self, entity: &EntityId) -> Result<Vec<Snapshot>, DuckStoreError> {
        let connection = self.pool.acquire()?;
        let params: [&dyn ToSql; 1] = [&entity.as_str()];
        query_payloads(
            &connection,
            "SELECT payload FROM snapshots WHERE entity_id = ? ORDER BY bucket_start",
            &params,
        )?
        .iter()
        .map(|payload| serde_json::from_str(payload).map_err(DuckStoreError::from))
        .collect()
    }

    pub fn list_failures(&self, entity: &EntityId) -> Result<Vec<FailureRecord>, DuckStoreError> {
        let connection = self.pool.acquire()?;
        let params: [&dyn ToSql; 1] = [&entity.as_str()];
        query_payloads(
            &connection,
            "SELECT payload FROM failure_log WHERE entity_id = ? ORDER BY snapshot_ts, recorded_at",
            &params,
        )?
        .iter()
        .map(|payload| serde_json::from_str(payload).map_err(DuckStoreError::from))
        .collect()
    }

    /// Value history of one partition across the stored snapshots of `entity`.
    pub fn partition_series(
        &self,
        entity: &EntityId,
        partition: &PartitionId,
    ) -> Result<Vec<PartitionValueRow>, DuckStoreError> {
        let connection = self.pool.acquire()?;
        let params: [&dyn ToSql; 2] = [&entity.as_str(), &partition.as_str()];
        let mut statement = connection.prepare(
            "SELECT bucket_start, usd_value, provenance, observed_at FROM partition_values \
             WHERE entity_id = ? AND partition_id = ? ORDER BY bucket_start",
        )?;
        let rows = statement
            .query_map(params.as_slice(), |row| {
                Ok(PartitionValueRow {
                    bucket_start: row.get(0)?,
                    usd_value: row.get(1)?,
                    provenance: row.get(2)?,
                    observed_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Writes `snapshot` into its `(entity, bucket)` slot unless a later computation holds it.
    ///
    /// # Panics
    /// Panics if the write lock is poisoned.
    pub fn write_snapshot(&self, snapshot: &Snapshot) -> Result<WriteDisposition, DuckStoreError> {
        let _guard = self
            .write_lock
            .lock()
            .expect("snapshot write lock is not poisoned");
        let connection = self.pool.acquire()?;

        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<WriteDisposition, DuckStoreError> {
            let existing = select_snapshot(&connection, &snapshot.entity_id, snapshot.bucket_start)?;
            let disposition = resolve_write(existing.as_ref(), snapshot);
            if disposition == WriteDisposition::SupersededByNewer {
                return Ok(disposition);
            }

            let payload = serde_json::to_string(snapshot)?;
            let computed_at = snapshot.computed_at.format_rfc3339();
            let run_id = snapshot.run_id.to_string();
            let params: [&dyn ToSql; 7] = [
                &snapshot.entity_id.as_str(),
                &snapshot.bucket_start,
                &snapshot.timestamp.unix_timestamp(),
                &computed_at,
                &run_id,
                &snapshot.total_usd,
                &payload,
            ];
            connection.execute(
                "INSERT OR REPLACE INTO snapshots \
                 (entity_id, bucket_start, snapshot_ts, computed_at, run_id, total_usd, payload, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)",
                params.as_slice(),
            )?;

            let params: [&dyn ToSql; 2] = [&snapshot.entity_id.as_str(), &snapshot.bucket_start];
            connection.execute(
                "DELETE FROM partition_values WHERE entity_id = ? AND bucket_start = ?",
                params.as_slice(),
            )?;

            let partitions: BTreeSet<&PartitionId> = snapshot
                .provenance
                .keys()
                .chain(snapshot.per_partition_usd.keys())
                .collect();
            for partition in partitions {
                let usd_value = snapshot.per_partition_usd.get(partition).copied();
                let provenance = snapshot
                    .provenance
                    .get(partition)
                    .map_or("live", |provenance| provenance.label());
                let observed_at = snapshot
                    .observed_at(partition)
                    .map(UtcDateTime::format_rfc3339);
                let params: [&dyn ToSql; 6] = [
                    &snapshot.entity_id.as_str(),
                    &snapshot.bucket_start,
                    &partition.as_str(),
                    &usd_value,
                    &provenance,
                    &observed_at,
                ];
                connection.execute(
                    "INSERT INTO partition_values \
                     (entity_id, bucket_start, partition_id, usd_value, provenance, observed_at) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                    params.as_slice(),
                )?;
            }

            Ok(disposition)
        })();

        let disposition = finalize_transaction(&connection, result)?;
        match disposition {
            WriteDisposition::SupersededByNewer => warn!(
                entity = %snapshot.entity_id,
                bucket_start = snapshot.bucket_start,
                "kept newer snapshot already in slot"
            ),
            _ => debug!(
                entity = %snapshot.entity_id,
                bucket_start = snapshot.bucket_start,
                ?disposition,
                "snapshot written"
            ),
        }
        Ok(disposition)
    }

    pub fn append_failure(&self, record: &FailureRecord) -> Result<(), DuckStoreError> {
        let connection = self.pool.acquire()?;
        let payload = serde_json::to_string(record)?;
        let run_id = record.run_id.to_string();
        let recorded_at = record.recorded_at.format_rfc3339();
        let params: [&dyn ToSql; 6] = [
            &run_id,
            &record.entity_id.as_str(),
            &record.timestamp.unix_timestamp(),
            &recorded_at,
            &record.kind.code(),
            &payload,
        ];
        connection.execute(
            "INSERT INTO failure_log \
             (run_id, entity_id, snapshot_ts, recorded_at, kind, payload) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Runs `job` on the blocking pool with a clone of this store.
    fn blocking<T, F>(&self, job: F) -> impl Future<Output = Result<T, StoreError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(Self) -> Result<T, DuckStoreError> + Send + 'static,
    {
        let store = self.clone();
        async move {
            tokio::task::spawn_blocking(move || job(store))
                .await
                .map_err(|join_error| StoreError::from(DuckStoreError::Task(join_error.to_string())))?
                .map_err(StoreError::from)
        }
    }
}

impl SnapshotStore for DuckDbSnapshotStore {
    fn latest_at_or_before<'a>(
        &'a self,
        entity: &'a EntityId,
        at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Option<Snapshot>, StoreError>> {
        let entity = entity.clone();
        Box::pin(self.blocking(move |store| store.latest_snapshot_at_or_before(&entity, at)))
    }

    fn latest_with_partition_at_or_before<'a>(
        &'a self,
        entity: &'a EntityId,
        partition: &'a PartitionId,
        at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Option<Snapshot>, StoreError>> {
        let entity = entity.clone();
        let partition = partition.clone();
        Box::pin(self.blocking(move |store| {
            store.latest_snapshot_with_partition(&entity, &partition, at)
        }))
    }

    fn upsert<'a>(
        &'a self,
        snapshot: &'a Snapshot,
    ) -> BoxFuture<'a, Result<WriteDisposition, StoreError>> {
        let snapshot = snapshot.clone();
        Box::pin(self.blocking(move |store| store.write_snapshot(&snapshot)))
    }

    fn record_failure<'a>(
        &'a self,
        record: &'a FailureRecord,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        let record = record.clone();
        Box::pin(self.blocking(move |store| store.append_failure(&record)))
    }
}

fn select_snapshot(
    connection: &Connection,
    entity: &EntityId,
    bucket_start: i64,
) -> Result<Option<Snapshot>, DuckStoreError> {
    let params: [&dyn ToSql; 2] = [&entity.as_str(), &bucket_start];
    let payloads = query_payloads(
        connection,
        "SELECT payload FROM snapshots WHERE entity_id = ? AND bucket_start = ?",
        &params,
    )?;
    payloads
        .first()
        .map(|payload| serde_json::from_str(payload))
        .transpose()
        .map_err(DuckStoreError::from)
}

fn query_payloads(
    connection: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<String>, DuckStoreError> {
    let mut statement = connection.prepare(sql)?;
    let payloads = statement
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(payloads)
}

fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, DuckStoreError>,
) -> Result<T, DuckStoreError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn resolve_chainvalue_home() -> PathBuf {
    if let Some(path) = env::var_os("CHAINVALUE_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".chainvalue");
    }

    PathBuf::from(".chainvalue")
}
