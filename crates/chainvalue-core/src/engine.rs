//! Run orchestration: fetch, fall back, aggregate, persist.
//!
//! ```text
//! RateBook::load ─► Runner::fetch_all ─► (failed?) store lookup ─► fallback::decide
//!                                                                        │
//!                       SnapshotWriter::commit / report_failure ◄─ aggregate
//! ```
//!
//! A run never returns an error for partition, aggregation or persistence
//! problems; they are all reflected in the [`RunReport`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::{
    aggregate, confirmed_total, confirmed_value, AggregateOutcome, PartitionLine,
};
use crate::fallback::{decide, DenyReason, FallbackCandidate, FallbackDecision};
use crate::valuation::RateRejection;
use crate::{
    AggregationFailure, CancelToken, Currency, Diagnostic, EngineConfig, EngineError, Entity,
    EntityId, PartitionId, PartitionResult, PriceSource, RateBook, ReferenceSource,
    RequestThrottle, Runner, Snapshot, SnapshotStore, SnapshotWriter, SourceRegistry, UtcDateTime,
    ValidationError, WriteDisposition,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Outcome of the final write of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Persistence {
    Written {
        disposition: WriteDisposition,
        bucket_start: i64,
    },
    Failed {
        error: String,
    },
}

/// Caller-facing result of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub entity_id: EntityId,
    pub timestamp: UtcDateTime,
    pub status: RunStatus,
    /// Present only when the run succeeded.
    pub total_usd: Option<f64>,
    pub partitions: Vec<PartitionLine>,
    pub diagnostics: Vec<Diagnostic>,
    pub failure: Option<String>,
    pub rate_rejections: Vec<RateRejection>,
    /// Present only when the run succeeded.
    pub persistence: Option<Persistence>,
    pub failure_recorded: bool,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn partition(&self, partition: &PartitionId) -> Option<&PartitionLine> {
        self.partitions
            .iter()
            .find(|line| &line.partition == partition)
    }

    fn cancelled(
        run_id: Uuid,
        entity: &Entity,
        at: UtcDateTime,
        partitions: Vec<PartitionLine>,
        rate_rejections: Vec<RateRejection>,
    ) -> Self {
        Self {
            run_id,
            entity_id: entity.id.clone(),
            timestamp: at,
            status: RunStatus::Cancelled,
            total_usd: None,
            partitions,
            diagnostics: Vec::new(),
            failure: Some(String::from("run was cancelled")),
            rate_rejections,
            persistence: None,
            failure_recorded: false,
        }
    }
}

pub struct EngineBuilder {
    registry: SourceRegistry,
    prices: Arc<dyn PriceSource>,
    store: Arc<dyn SnapshotStore>,
    config: EngineConfig,
    reference: Option<(Arc<dyn ReferenceSource>, Vec<Currency>)>,
    throttle: Option<RequestThrottle>,
}

impl EngineBuilder {
    pub fn new(
        registry: SourceRegistry,
        prices: Arc<dyn PriceSource>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            registry,
            prices,
            store,
            config: EngineConfig::default(),
            reference: None,
            throttle: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Oracle used to admit conversion rates for `currencies` at the start of each run.
    pub fn with_reference_source(
        mut self,
        source: Arc<dyn ReferenceSource>,
        currencies: Vec<Currency>,
    ) -> Self {
        self.reference = Some((source, currencies));
        self
    }

    pub fn with_throttle(mut self, throttle: RequestThrottle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn build(self) -> Result<Engine, ValidationError> {
        self.config.validate()?;

        let mut runner = Runner::new(
            Arc::new(self.registry),
            self.prices,
            self.config.retry_policy(),
            self.config.attempt_timeout(),
        );
        if let Some(throttle) = self.throttle {
            runner = runner.with_throttle(throttle);
        }

        let writer = SnapshotWriter::new(Arc::clone(&self.store), self.config.bucket_seconds);

        Ok(Engine {
            config: self.config,
            runner,
            store: self.store,
            writer,
            reference: self.reference,
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    runner: Runner,
    store: Arc<dyn SnapshotStore>,
    writer: SnapshotWriter,
    reference: Option<(Arc<dyn ReferenceSource>, Vec<Currency>)>,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Computes, and on success persists, the snapshot of `entity` at `at`.
    pub async fn run(&self, entity: &Entity, at: UtcDateTime, cancel: &CancelToken) -> RunReport {
        self.run_with_id(Uuid::new_v4(), entity, at, cancel).await
    }

    /// Starts a run on the runtime and returns a handle to cancel or await it.
    pub fn spawn(self: &Arc<Self>, entity: Entity, at: UtcDateTime) -> RunHandle {
        let run_id = Uuid::new_v4();
        let token = CancelToken::new();
        let engine = Arc::clone(self);
        let task_token = token.clone();
        let join =
            tokio::spawn(async move { engine.run_with_id(run_id, &entity, at, &task_token).await });

        RunHandle {
            run_id,
            token,
            join,
        }
    }

    async fn run_with_id(
        &self,
        run_id: Uuid,
        entity: &Entity,
        at: UtcDateTime,
        cancel: &CancelToken,
    ) -> RunReport {
        let span = info_span!("run", %run_id, entity = %entity.id);
        self.execute(run_id, entity, at, cancel)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        entity: &Entity,
        at: UtcDateTime,
        cancel: &CancelToken,
    ) -> RunReport {
        if cancel.is_cancelled() {
            info!("run cancelled before start");
            return RunReport::cancelled(run_id, entity, at, Vec::new(), Vec::new());
        }

        info!(partitions = entity.partitions().len(), %at, "run started");

        let (rates, rate_rejections) = match &self.reference {
            Some((source, currencies)) => {
                RateBook::load(
                    source.as_ref(),
                    currencies,
                    self.config.reference_staleness_seconds,
                    at,
                )
                .await
            }
            None => (RateBook::new(), Vec::new()),
        };

        let results = self
            .runner
            .fetch_all(at, entity.partitions(), Arc::new(rates), cancel)
            .await;

        if cancel.is_cancelled() {
            info!("run cancelled; nothing persisted");
            let outcome = aggregate(
                entity,
                at,
                &results,
                &BTreeMap::new(),
                &self.config.aggregate_policy(),
            );
            return RunReport::cancelled(run_id, entity, at, outcome.lines, rate_rejections);
        }

        let decisions = self.decide_fallbacks(entity, at, &results).await;
        let outcome = aggregate(
            entity,
            at,
            &results,
            &decisions,
            &self.config.aggregate_policy(),
        );

        self.finish(run_id, outcome, rate_rejections).await
    }

    async fn decide_fallbacks(
        &self,
        entity: &Entity,
        at: UtcDateTime,
        results: &BTreeMap<PartitionId, PartitionResult>,
    ) -> BTreeMap<PartitionId, FallbackDecision> {
        let failed: Vec<&PartitionId> = results
            .iter()
            .filter(|(_, result)| confirmed_value(result).is_none())
            .map(|(partition, _)| partition)
            .collect();
        if failed.is_empty() {
            return BTreeMap::new();
        }

        let latest = self.store.latest_at_or_before(&entity.id, at).await;
        if let Err(store_error) = &latest {
            warn!(error = %store_error, "snapshot history lookup failed");
        }

        let confirmed = confirmed_total(results);
        let window = self.config.window();
        let mut decisions = BTreeMap::new();

        for partition in failed {
            let candidate = match &latest {
                Err(store_error) => Err(store_error.to_string()),
                Ok(snapshot) => self.candidate_for(entity, partition, at, snapshot.as_ref()).await,
            };
            let decision = match candidate {
                Err(message) => {
                    FallbackDecision::denied(DenyReason::HistoryUnavailable { message })
                }
                Ok(candidate) => decide(partition, candidate.as_ref(), confirmed, &window, at),
            };

            match &decision {
                FallbackDecision::Admit(admitted) => info!(
                    partition = %partition,
                    value = admitted.candidate.value,
                    snapshot_at = %admitted.candidate.snapshot_at,
                    share = admitted.share,
                    "fallback admitted"
                ),
                FallbackDecision::Deny(denial) => warn!(
                    partition = %partition,
                    reason = %denial.reason,
                    "fallback denied"
                ),
            }
            decisions.insert(partition.clone(), decision);
        }

        decisions
    }

    /// `partition`'s slice of the latest snapshot, or of the most recent older
    /// one that still holds a value for it.
    async fn candidate_for(
        &self,
        entity: &Entity,
        partition: &PartitionId,
        at: UtcDateTime,
        latest: Option<&Snapshot>,
    ) -> Result<Option<FallbackCandidate>, String> {
        let Some(latest) = latest else {
            return Ok(None);
        };
        if let Some(candidate) = FallbackCandidate::from_snapshot(latest, partition) {
            return Ok(Some(candidate));
        }

        let older = self
            .store
            .latest_with_partition_at_or_before(&entity.id, partition, at)
            .await
            .map_err(|store_error| {
                warn!(partition = %partition, error = %store_error, "partition history lookup failed");
                store_error.to_string()
            })?;
        Ok(older.and_then(|snapshot| FallbackCandidate::from_snapshot(&snapshot, partition)))
    }

    async fn finish(
        &self,
        run_id: Uuid,
        outcome: AggregateOutcome,
        rate_rejections: Vec<RateRejection>,
    ) -> RunReport {
        if outcome.success {
            let persistence = match self.writer.commit(&outcome, run_id).await {
                Ok(persisted) => Persistence::Written {
                    disposition: persisted.disposition,
                    bucket_start: persisted.snapshot.bucket_start,
                },
                Err(persist_error) => {
                    error!(error = %persist_error, "snapshot could not be persisted");
                    Persistence::Failed {
                        error: persist_error.to_string(),
                    }
                }
            };

            return RunReport {
                run_id,
                entity_id: outcome.entity_id,
                timestamp: outcome.timestamp,
                status: RunStatus::Succeeded,
                total_usd: Some(outcome.total_usd),
                partitions: outcome.lines,
                diagnostics: outcome.diagnostics,
                failure: None,
                rate_rejections,
                persistence: Some(persistence),
                failure_recorded: false,
            };
        }

        let kind = outcome.failure.unwrap_or(AggregationFailure::Omissions);
        let failure_recorded = self.writer.report_failure(&outcome, kind, run_id).await;
        let failure = outcome
            .failure_message()
            .unwrap_or_else(|| kind.to_string());

        RunReport {
            run_id,
            entity_id: outcome.entity_id,
            timestamp: outcome.timestamp,
            status: RunStatus::Failed,
            total_usd: None,
            partitions: outcome.lines,
            diagnostics: outcome.diagnostics,
            failure: Some(failure),
            rate_rejections,
            persistence: None,
            failure_recorded,
        }
    }
}

/// A run started with [`Engine::spawn`].
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    token: CancelToken,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Stops further retries. In-flight adapter calls finish; the report is `Cancelled`.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    pub async fn wait(self) -> Result<RunReport, EngineError> {
        let run_id = self.run_id;
        self.join.await.map_err(|join_error| EngineError::RunAborted {
            run_id,
            message: join_error.to_string(),
        })
    }
}
