//! Behavior-driven tests for partition fetching
//!
//! These tests verify HOW partitions are fetched: retry budgets, error
//! classification, per-attempt timeouts, concurrency and cancellation.

mod support;

use std::sync::Arc;
use std::time::Duration;

use chainvalue_core::{
    AssetId, Backoff, Balances, CancelToken, CircuitBreakerConfig, EngineBuilder, EngineConfig,
    Entity, EntityId, FetchError, FetchErrorKind, MemoryStore, PartitionId, PartitionSource,
    PartitionStatus, PriceError, RateBook, RequestThrottle, RetryPolicy, RunStatus, Runner,
    SourceRegistry, UtcDateTime,
};
use chainvalue_core::source::BoxFuture;
use support::{
    asset, entity, fast_config, now, pid, usd_prices, usdc, ScriptedSource, Step,
};
use tokio::sync::Barrier;

fn runner(registry: SourceRegistry, attempts: u32, timeout: Duration) -> Runner {
    Runner::new(
        Arc::new(registry),
        Arc::new(usd_prices()),
        RetryPolicy::new(attempts, Backoff::None),
        timeout,
    )
}

fn single(partition: &str, source: Arc<ScriptedSource>) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    registry.register(pid(partition), source);
    registry
}

// =============================================================================
// Retry budget and classification
// =============================================================================

#[tokio::test]
async fn when_transport_errors_clear_up_the_partition_succeeds_on_a_later_attempt() {
    // Given: Two transient failures, then an answer
    let source = Arc::new(ScriptedSource::new().script(
        "polygon",
        vec![
            Step::Err(FetchError::transport("connection reset")),
            Step::Err(FetchError::transport("connection reset")),
            Step::Ok(usdc(4.0)),
        ],
    ));

    // When: Three attempts are allowed
    let results = runner(single("polygon", Arc::clone(&source)), 3, Duration::from_secs(1))
        .fetch_all(now(), &[pid("polygon")], Arc::new(RateBook::new()), &CancelToken::new())
        .await;

    // Then: The third attempt wins
    let polygon = &results[&pid("polygon")];
    assert_eq!(polygon.status, PartitionStatus::Success);
    assert_eq!(polygon.attempts, 3);
    assert_eq!(polygon.usd_value, 4.0);
    assert_eq!(source.calls_for("polygon"), 3);
}

#[tokio::test]
async fn when_the_budget_is_one_attempt_a_transient_error_is_final() {
    let source = Arc::new(ScriptedSource::new().script(
        "polygon",
        vec![
            Step::Err(FetchError::transport("connection reset")),
            Step::Ok(usdc(4.0)),
        ],
    ));

    let results = runner(single("polygon", Arc::clone(&source)), 1, Duration::from_secs(1))
        .fetch_all(now(), &[pid("polygon")], Arc::new(RateBook::new()), &CancelToken::new())
        .await;

    let polygon = &results[&pid("polygon")];
    assert_eq!(polygon.status, PartitionStatus::Failed);
    assert_eq!(polygon.attempts, 1);
    assert_eq!(
        polygon.error.as_ref().map(FetchError::kind),
        Some(FetchErrorKind::Transport)
    );
}

#[tokio::test]
async fn when_the_response_is_malformed_it_is_not_retried() {
    let source = Arc::new(ScriptedSource::new().script(
        "polygon",
        vec![
            Step::Err(FetchError::malformed("unexpected field")),
            Step::Ok(usdc(4.0)),
        ],
    ));

    let results = runner(single("polygon", Arc::clone(&source)), 5, Duration::from_secs(1))
        .fetch_all(now(), &[pid("polygon")], Arc::new(RateBook::new()), &CancelToken::new())
        .await;

    assert_eq!(results[&pid("polygon")].status, PartitionStatus::Failed);
    assert_eq!(source.calls_for("polygon"), 1);
}

#[tokio::test]
async fn when_the_price_service_blips_the_attempt_is_retried() {
    // Given: A price source that is unavailable for one asset
    struct BlippingPrices {
        calls: std::sync::atomic::AtomicU32,
    }

    impl chainvalue_core::PriceSource for BlippingPrices {
        fn price<'a>(
            &'a self,
            _asset: &'a AssetId,
            _at: UtcDateTime,
        ) -> BoxFuture<'a, Result<chainvalue_core::UnitPrice, PriceError>> {
            Box::pin(async move {
                let call = self
                    .calls
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if call == 0 {
                    Err(PriceError::transient("price feed 503"))
                } else {
                    Ok(chainvalue_core::UnitPrice::usd(1.0))
                }
            })
        }
    }

    let source = Arc::new(ScriptedSource::new().script("ethereum", vec![Step::Ok(usdc(10.0))]));
    let runner = Runner::new(
        Arc::new(single("ethereum", Arc::clone(&source))),
        Arc::new(BlippingPrices {
            calls: std::sync::atomic::AtomicU32::new(0),
        }),
        RetryPolicy::new(2, Backoff::None),
        Duration::from_secs(1),
    );

    // When: The partition is fetched
    let results = runner
        .fetch_all(now(), &[pid("ethereum")], Arc::new(RateBook::new()), &CancelToken::new())
        .await;

    // Then: The second attempt is priced successfully
    let ethereum = &results[&pid("ethereum")];
    assert_eq!(ethereum.status, PartitionStatus::Success);
    assert_eq!(ethereum.attempts, 2);
    assert_eq!(ethereum.usd_value, 10.0);
}

// =============================================================================
// Timeouts
// =============================================================================

#[tokio::test]
async fn when_an_attempt_exceeds_its_timeout_it_counts_as_a_retryable_failure() {
    // Given: An adapter that always takes 500ms, with a 20ms budget per attempt
    let source = Arc::new(ScriptedSource::new().script(
        "polygon",
        vec![Step::Slow(
            Duration::from_millis(500),
            Box::new(Step::Ok(usdc(4.0))),
        )],
    ));

    // When: Two attempts are allowed
    let results = runner(single("polygon", Arc::clone(&source)), 2, Duration::from_millis(20))
        .fetch_all(now(), &[pid("polygon")], Arc::new(RateBook::new()), &CancelToken::new())
        .await;

    // Then: Both attempts time out
    let polygon = &results[&pid("polygon")];
    assert_eq!(polygon.status, PartitionStatus::Failed);
    assert_eq!(polygon.attempts, 2);
    assert_eq!(
        polygon.error.as_ref().map(FetchError::kind),
        Some(FetchErrorKind::Timeout)
    );
    assert_eq!(source.calls_for("polygon"), 2);
}

// =============================================================================
// Concurrency
// =============================================================================

struct RendezvousSource {
    barrier: Barrier,
}

impl PartitionSource for RendezvousSource {
    fn fetch<'a>(
        &'a self,
        _partition: &'a PartitionId,
        _at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Balances, FetchError>> {
        Box::pin(async move {
            self.barrier.wait().await;
            Ok(usdc(1.0))
        })
    }
}

#[tokio::test]
async fn when_several_partitions_are_fetched_they_run_concurrently() {
    // Given: An adapter that only answers once all three partitions are in flight
    let source = Arc::new(RendezvousSource {
        barrier: Barrier::new(3),
    });
    let mut registry = SourceRegistry::new();
    registry.register_all([pid("ethereum"), pid("polygon"), pid("arbitrum")], source);

    // When: All three are fetched
    let fetch_runner = runner(registry, 1, Duration::from_secs(5));
    let partitions = [pid("ethereum"), pid("polygon"), pid("arbitrum")];
    let cancel = CancelToken::new();
    let fetch = fetch_runner.fetch_all(
        now(),
        &partitions,
        Arc::new(RateBook::new()),
        &cancel,
    );
    let results = tokio::time::timeout(Duration::from_secs(2), fetch)
        .await
        .expect("sequential fetching would never pass the barrier");

    // Then: Every partition succeeded
    assert!(results.values().all(|result| result.is_success()));
}

#[tokio::test]
async fn when_one_partition_is_slow_to_fail_its_siblings_still_succeed() {
    let source = Arc::new(
        ScriptedSource::new()
            .script("ethereum", vec![Step::Ok(usdc(100.0))])
            .script(
                "polygon",
                vec![Step::Slow(
                    Duration::from_millis(50),
                    Box::new(Step::Err(FetchError::transport("RPC Failed for Polygon"))),
                )],
            ),
    );
    let mut registry = SourceRegistry::new();
    registry.register_all([pid("ethereum"), pid("polygon")], source);

    let results = runner(registry, 2, Duration::from_secs(1))
        .fetch_all(
            now(),
            &[pid("ethereum"), pid("polygon")],
            Arc::new(RateBook::new()),
            &CancelToken::new(),
        )
        .await;

    assert!(results[&pid("ethereum")].is_success());
    assert!(!results[&pid("polygon")].is_success());
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn when_a_run_is_cancelled_during_backoff_it_reports_cancelled_and_persists_nothing() {
    // Given: Polygon keeps failing and retries wait ten seconds
    let source = Arc::new(
        ScriptedSource::new()
            .script("ethereum", vec![Step::Ok(usdc(100.0))])
            .script(
                "polygon",
                vec![Step::Err(FetchError::transport("RPC Failed for Polygon"))],
            ),
    );
    let mut registry = SourceRegistry::new();
    registry.register_all([pid("ethereum"), pid("polygon")], Arc::clone(&source) as _);
    let store = MemoryStore::new();
    let engine = Arc::new(
        EngineBuilder::new(registry, Arc::new(usd_prices()), Arc::new(store.clone()))
            .with_config(EngineConfig {
                max_retries: 5,
                backoff_base_ms: 10_000,
                backoff_max_ms: 10_000,
                backoff_jitter: false,
                ..EngineConfig::default()
            })
            .build()
            .expect("engine builds"),
    );

    // When: The run is cancelled while polygon waits to retry
    let handle = engine.spawn(entity(&["ethereum", "polygon"]), now());
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();
    let report = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("cancellation must interrupt the backoff")
        .expect("run task completes");

    // Then: The run is cancelled, distinct from failed, and nothing is written
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(source.calls_for("polygon"), 1);
    assert!(store.is_empty().await);
    assert!(store.failures().await.is_empty());
}

#[tokio::test]
async fn when_a_run_is_cancelled_in_flight_calls_are_allowed_to_finish() {
    let source = Arc::new(ScriptedSource::new().script(
        "ethereum",
        vec![Step::Slow(
            Duration::from_millis(100),
            Box::new(Step::Ok(usdc(1.0))),
        )],
    ));
    let store = MemoryStore::new();
    let engine = Arc::new(
        EngineBuilder::new(
            single("ethereum", Arc::clone(&source)),
            Arc::new(usd_prices()),
            Arc::new(store.clone()),
        )
        .with_config(fast_config(3))
        .build()
        .expect("engine builds"),
    );

    let handle = engine.spawn(entity(&["ethereum"]), now());
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();
    let report = handle.wait().await.expect("run task completes");

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(source.completed(), 1);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn when_one_of_two_concurrent_runs_is_cancelled_the_other_still_succeeds() {
    // Given: One engine shared by two entities that both hold ethereum;
    // only the first also holds arbitrum, which keeps failing
    let source = Arc::new(
        ScriptedSource::new()
            .script(
                "ethereum",
                vec![Step::Slow(
                    Duration::from_millis(150),
                    Box::new(Step::Ok(usdc(100.0))),
                )],
            )
            .script(
                "arbitrum",
                vec![Step::Err(FetchError::transport("RPC Failed for Arbitrum"))],
            ),
    );
    let mut registry = SourceRegistry::new();
    registry.register_all([pid("ethereum"), pid("arbitrum")], Arc::clone(&source) as _);
    let store = MemoryStore::new();
    let engine = Arc::new(
        EngineBuilder::new(registry, Arc::new(usd_prices()), Arc::new(store.clone()))
            .with_config(EngineConfig {
                max_retries: 5,
                backoff_base_ms: 10_000,
                backoff_max_ms: 10_000,
                backoff_jitter: false,
                ..EngineConfig::default()
            })
            .build()
            .expect("engine builds"),
    );
    let vault = Entity::new(
        EntityId::parse("ledgity-vault").expect("valid entity id"),
        "Ledgity vault",
        vec![pid("ethereum"), pid("arbitrum")],
    )
    .expect("valid entity");
    let pool = Entity::new(
        EntityId::parse("ledgity-pool").expect("valid entity id"),
        "Ledgity pool",
        vec![pid("ethereum")],
    )
    .expect("valid entity");

    // When: Both runs start together and only the vault run is cancelled
    let vault_run = engine.spawn(vault, now());
    let pool_run = engine.spawn(pool, now());
    assert_ne!(vault_run.run_id(), pool_run.run_id());
    tokio::time::sleep(Duration::from_millis(50)).await;
    vault_run.cancel();

    let (vault_report, pool_report) = tokio::time::timeout(Duration::from_secs(5), async {
        (vault_run.wait().await, pool_run.wait().await)
    })
    .await
    .expect("both runs finish");
    let vault_report = vault_report.expect("vault task completes");
    let pool_report = pool_report.expect("pool task completes");

    // Then: Only the vault run is cancelled; the pool run persists its snapshot
    assert_eq!(vault_report.status, RunStatus::Cancelled);
    assert_eq!(pool_report.status, RunStatus::Succeeded);
    assert_eq!(pool_report.total_usd, Some(100.0));
    let ethereum = pool_report
        .partition(&pid("ethereum"))
        .expect("ethereum line");
    assert_eq!(ethereum.attempts, 1);

    // And: The shared ethereum source served both runs to completion
    assert_eq!(source.calls_for("ethereum"), 2);
    assert_eq!(source.calls_for("arbitrum"), 1);
    assert_eq!(store.len().await, 1);
    assert_eq!(store.snapshots(&pool_report.entity_id).await.len(), 1);
    assert!(store.failures().await.is_empty());
}

// =============================================================================
// Circuit breaker and throttling
// =============================================================================

#[tokio::test]
async fn when_a_source_keeps_failing_its_circuit_opens_and_stops_calling_it() {
    // Given: A breaker that opens after one failure
    let source = Arc::new(ScriptedSource::new().script(
        "polygon",
        vec![Step::Err(FetchError::transport("RPC Failed for Polygon"))],
    ));
    let mut registry = SourceRegistry::with_breaker_config(CircuitBreakerConfig {
        failure_threshold: 1,
        open_timeout: Duration::from_secs(60),
    });
    registry.register(pid("polygon"), Arc::clone(&source) as _);
    let runner = runner(registry, 1, Duration::from_secs(1));

    // When: The partition is fetched twice
    for _ in 0..2 {
        runner
            .fetch_all(now(), &[pid("polygon")], Arc::new(RateBook::new()), &CancelToken::new())
            .await;
    }
    let results = runner
        .fetch_all(now(), &[pid("polygon")], Arc::new(RateBook::new()), &CancelToken::new())
        .await;

    // Then: Only the first fetch reached the adapter
    assert_eq!(source.calls_for("polygon"), 1);
    assert_eq!(
        results[&pid("polygon")].error.as_ref().map(FetchError::kind),
        Some(FetchErrorKind::CircuitOpen)
    );
}

#[tokio::test]
async fn when_a_throttle_is_configured_every_attempt_draws_from_it() {
    let source = Arc::new(
        ScriptedSource::new()
            .script("ethereum", vec![Step::Ok(usdc(1.0))])
            .script("polygon", vec![Step::Ok(usdc(1.0))]),
    );
    let mut registry = SourceRegistry::new();
    registry.register_all([pid("ethereum"), pid("polygon")], source);
    let throttle = RequestThrottle::new(Duration::from_secs(60), 2);

    let results = runner(registry, 1, Duration::from_secs(1))
        .with_throttle(throttle.clone())
        .fetch_all(
            now(),
            &[pid("ethereum"), pid("polygon")],
            Arc::new(RateBook::new()),
            &CancelToken::new(),
        )
        .await;

    assert!(results.values().all(|result| result.is_success()));
    assert!(!throttle.try_acquire(), "both units were spent by the run");
}

#[tokio::test]
async fn when_price_lookups_fail_for_an_asset_the_partition_records_the_asset() {
    let source = Arc::new(ScriptedSource::new().script("ethereum", vec![Step::Ok({
        let mut balances = usdc(1.0);
        balances.insert(asset("unknown-token"), 3.0);
        balances
    })]));

    let results = runner(single("ethereum", source), 2, Duration::from_secs(1))
        .fetch_all(now(), &[pid("ethereum")], Arc::new(RateBook::new()), &CancelToken::new())
        .await;

    let error = results[&pid("ethereum")]
        .error
        .clone()
        .expect("price failure recorded");
    assert_eq!(error.kind(), FetchErrorKind::PriceUnavailable);
    assert!(error.message().contains("unknown-token"));
}
