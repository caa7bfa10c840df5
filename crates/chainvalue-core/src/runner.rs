//! Concurrent, bounded-retry fetching of every partition of an entity.
//!
//! Each partition runs in its own task and owns its attempt counter. A
//! partition's failure never delays or cancels its siblings, and failures
//! are returned as [`PartitionResult`]s rather than raised.
//!
//! One attempt is:
//!
//! 1. wait on the shared [`RequestThrottle`], if any;
//! 2. ask the partition's [`CircuitBreaker`](crate::CircuitBreaker) for permission;
//! 3. fetch raw balances from the [`PartitionSource`](crate::PartitionSource);
//! 4. price and convert them to USD.
//!
//! Steps 3 and 4 share a single per-attempt deadline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, info_span, warn, Instrument};

use crate::source::RegisteredSource;
use crate::valuation::{value_balances, Valuation};
use crate::{
    Balances, CancelToken, FetchError, PartitionId, PartitionResult, PriceSource, RateBook,
    RequestThrottle, RetryPolicy, SourceRegistry, UtcDateTime,
};

#[derive(Clone)]
pub struct Runner {
    registry: Arc<SourceRegistry>,
    prices: Arc<dyn PriceSource>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    throttle: Option<RequestThrottle>,
}

impl Runner {
    pub fn new(
        registry: Arc<SourceRegistry>,
        prices: Arc<dyn PriceSource>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            prices,
            policy,
            attempt_timeout,
            throttle: None,
        }
    }

    pub fn with_throttle(mut self, throttle: RequestThrottle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Fetches and values every partition concurrently and waits for all of them.
    pub async fn fetch_all(
        &self,
        at: UtcDateTime,
        partitions: &[PartitionId],
        rates: Arc<RateBook>,
        cancel: &CancelToken,
    ) -> BTreeMap<PartitionId, PartitionResult> {
        let mut handles = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let runner = self.clone();
            let task_partition = partition.clone();
            let rates = Arc::clone(&rates);
            let cancel = cancel.clone();
            let span = info_span!("partition", partition = %partition);

            let handle = tokio::spawn(
                async move {
                    runner
                        .fetch_partition(task_partition, at, &rates, &cancel)
                        .await
                }
                .instrument(span),
            );
            handles.push((partition.clone(), handle));
        }

        let mut results = BTreeMap::new();
        for (partition, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    warn!(partition = %partition, error = %join_error, "partition task aborted");
                    PartitionResult::failed(
                        partition.clone(),
                        FetchError::internal(format!("partition task aborted: {join_error}")),
                        0,
                    )
                }
            };
            results.insert(partition, result);
        }
        results
    }

    async fn fetch_partition(
        &self,
        partition: PartitionId,
        at: UtcDateTime,
        rates: &RateBook,
        cancel: &CancelToken,
    ) -> PartitionResult {
        let Some(registered) = self.registry.get(&partition).cloned() else {
            let error = FetchError::source_not_registered(&partition);
            warn!(error = %error, "partition has no source");
            return PartitionResult::failed(partition, error, 0);
        };

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return PartitionResult::failed(partition, FetchError::cancelled(), attempt);
            }

            if let Some(throttle) = &self.throttle {
                tokio::select! {
                    () = throttle.acquire() => {}
                    () = cancel.cancelled() => {
                        return PartitionResult::failed(partition, FetchError::cancelled(), attempt);
                    }
                }
            }

            attempt += 1;
            let error = match self.attempt(&registered, &partition, at, rates).await {
                Ok((raw, valuation)) => {
                    debug!(attempt, usd_value = valuation.total_usd, "partition resolved");
                    return PartitionResult::succeeded(
                        partition,
                        raw,
                        valuation.usd_balances,
                        valuation.total_usd,
                        attempt,
                    );
                }
                Err(error) => error,
            };

            if !error.retryable() || !self.policy.allows_retry_after(attempt) {
                warn!(attempt, code = error.code(), error = %error, "partition failed");
                return PartitionResult::failed(partition, error, attempt);
            }

            let delay = self.policy.delay_after_attempt(attempt);
            debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                code = error.code(),
                error = %error,
                "retrying partition"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    return PartitionResult::failed(partition, FetchError::cancelled(), attempt);
                }
            }
        }
    }

    async fn attempt(
        &self,
        registered: &RegisteredSource,
        partition: &PartitionId,
        at: UtcDateTime,
        rates: &RateBook,
    ) -> Result<(Balances, Valuation), FetchError> {
        registered.breaker.guard(partition)?;

        let deadline = Instant::now() + self.attempt_timeout;
        let fetched = timeout_at(deadline, registered.source.fetch(partition, at))
            .await
            .unwrap_or_else(|_| Err(self.timeout_error()));
        registered.breaker.record(&fetched);
        let raw = fetched?;

        let valuation = timeout_at(
            deadline,
            value_balances(self.prices.as_ref(), rates, &raw, at),
        )
        .await
        .unwrap_or_else(|_| Err(self.timeout_error()))?;

        Ok((raw, valuation))
    }

    fn timeout_error(&self) -> FetchError {
        FetchError::timeout(u64::try_from(self.attempt_timeout.as_millis()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{FixedPartitionSource, FixedPriceSource};
    use crate::{AssetId, Backoff, FetchErrorKind, PartitionStatus, UnitPrice};

    fn pid(value: &str) -> PartitionId {
        PartitionId::parse(value).expect("valid partition")
    }

    fn at() -> UtcDateTime {
        UtcDateTime::from_unix(1_700_000_000).expect("in range")
    }

    fn usdc_balances(amount: f64) -> Balances {
        let mut balances = Balances::new();
        balances.insert(AssetId::parse("usdc").expect("valid asset"), amount);
        balances
    }

    fn runner_for(source: Arc<FixedPartitionSource>, partitions: &[&str], attempts: u32) -> Runner {
        let mut registry = SourceRegistry::new();
        registry.register_all(partitions.iter().map(|p| pid(p)), source);
        let prices = FixedPriceSource::new()
            .with_price(AssetId::parse("usdc").expect("valid asset"), UnitPrice::usd(1.0));
        Runner::new(
            Arc::new(registry),
            Arc::new(prices),
            RetryPolicy::new(attempts, Backoff::None),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn transport_failures_use_the_whole_budget() {
        let source = Arc::new(
            FixedPartitionSource::new()
                .with_balances(pid("ethereum"), usdc_balances(100.0))
                .with_failure(pid("polygon"), FetchError::transport("RPC Failed for Polygon")),
        );
        let runner = runner_for(Arc::clone(&source), &["ethereum", "polygon"], 3);

        let results = runner
            .fetch_all(
                at(),
                &[pid("ethereum"), pid("polygon")],
                Arc::new(RateBook::new()),
                &CancelToken::new(),
            )
            .await;

        let ethereum = &results[&pid("ethereum")];
        assert_eq!(ethereum.status, PartitionStatus::Success);
        assert_eq!(ethereum.usd_value, 100.0);
        assert_eq!(ethereum.attempts, 1);

        let polygon = &results[&pid("polygon")];
        assert_eq!(polygon.status, PartitionStatus::Failed);
        assert_eq!(polygon.attempts, 3);
        assert_eq!(source.calls_for(&pid("polygon")), 3);
    }

    #[tokio::test]
    async fn malformed_responses_are_not_retried() {
        let source = Arc::new(
            FixedPartitionSource::new()
                .with_failure(pid("polygon"), FetchError::malformed("unexpected payload")),
        );
        let runner = runner_for(Arc::clone(&source), &["polygon"], 5);

        let results = runner
            .fetch_all(at(), &[pid("polygon")], Arc::new(RateBook::new()), &CancelToken::new())
            .await;

        assert_eq!(results[&pid("polygon")].attempts, 1);
        assert_eq!(source.calls_for(&pid("polygon")), 1);
    }

    #[tokio::test]
    async fn unregistered_partition_fails_without_attempts() {
        let source = Arc::new(FixedPartitionSource::new());
        let runner = runner_for(source, &[], 3);

        let results = runner
            .fetch_all(at(), &[pid("base")], Arc::new(RateBook::new()), &CancelToken::new())
            .await;

        let base = &results[&pid("base")];
        assert_eq!(base.attempts, 0);
        assert_eq!(
            base.error.as_ref().map(FetchError::kind),
            Some(FetchErrorKind::SourceNotRegistered)
        );
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_attempt() {
        let source = Arc::new(
            FixedPartitionSource::new().with_balances(pid("ethereum"), usdc_balances(1.0)),
        );
        let runner = runner_for(Arc::clone(&source), &["ethereum"], 3);
        let cancel = CancelToken::new();
        cancel.cancel();

        let results = runner
            .fetch_all(at(), &[pid("ethereum")], Arc::new(RateBook::new()), &cancel)
            .await;

        assert_eq!(
            results[&pid("ethereum")].error.as_ref().map(FetchError::kind),
            Some(FetchErrorKind::Cancelled)
        );
        assert_eq!(source.total_calls(), 0);
    }
}
