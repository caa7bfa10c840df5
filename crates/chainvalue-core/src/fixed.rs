//! Fixture-backed sources.
//!
//! Deterministic, in-memory implementations of the source traits. The CLI
//! builds them from a JSON fixture file; tests use them directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::source::BoxFuture;
use crate::{
    AssetId, Balances, Currency, FetchError, PartitionId, PartitionSource, PriceError,
    PriceSource, ReferenceReading, ReferenceSource, UnitPrice, UtcDateTime,
};

/// Returns canned balances per partition, or a canned error.
#[derive(Debug, Default)]
pub struct FixedPartitionSource {
    balances: HashMap<PartitionId, Balances>,
    failures: HashMap<PartitionId, FetchError>,
    calls: Mutex<HashMap<PartitionId, u32>>,
    total_calls: AtomicU32,
}

impl FixedPartitionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balances(mut self, partition: PartitionId, balances: Balances) -> Self {
        self.failures.remove(&partition);
        self.balances.insert(partition, balances);
        self
    }

    /// Every fetch for `partition` fails with `error`.
    pub fn with_failure(mut self, partition: PartitionId, error: FetchError) -> Self {
        self.balances.remove(&partition);
        self.failures.insert(partition, error);
        self
    }

    /// Number of fetches made for `partition` so far.
    pub fn calls_for(&self, partition: &PartitionId) -> u32 {
        self.calls
            .lock()
            .expect("call counter lock is not poisoned")
            .get(partition)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.total_calls.load(Ordering::SeqCst)
    }

    fn answer(&self, partition: &PartitionId) -> Result<Balances, FetchError> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .expect("call counter lock is not poisoned")
            .entry(partition.clone())
            .or_insert(0) += 1;

        if let Some(error) = self.failures.get(partition) {
            return Err(error.clone());
        }

        self.balances.get(partition).cloned().ok_or_else(|| {
            FetchError::malformed(format!("no balances recorded for partition '{partition}'"))
        })
    }
}

impl PartitionSource for FixedPartitionSource {
    fn fetch<'a>(
        &'a self,
        partition: &'a PartitionId,
        _at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Balances, FetchError>> {
        Box::pin(async move { self.answer(partition) })
    }
}

/// Returns canned unit prices. Unknown assets fail permanently.
#[derive(Debug, Clone, Default)]
pub struct FixedPriceSource {
    prices: HashMap<AssetId, Result<UnitPrice, PriceError>>,
}

impl FixedPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, asset: AssetId, price: UnitPrice) -> Self {
        self.prices.insert(asset, Ok(price));
        self
    }

    pub fn with_error(mut self, asset: AssetId, error: PriceError) -> Self {
        self.prices.insert(asset, Err(error));
        self
    }
}

impl PriceSource for FixedPriceSource {
    fn price<'a>(
        &'a self,
        asset: &'a AssetId,
        _at: UtcDateTime,
    ) -> BoxFuture<'a, Result<UnitPrice, PriceError>> {
        Box::pin(async move {
            match self.prices.get(asset) {
                Some(answer) => answer.clone(),
                None => Err(PriceError::permanent(format!(
                    "no price recorded for asset '{asset}'"
                ))),
            }
        })
    }
}

/// Returns the first canned reading quoting the requested currency.
#[derive(Debug, Clone, Default)]
pub struct FixedReferenceSource {
    readings: Vec<ReferenceReading>,
}

impl FixedReferenceSource {
    pub fn new(readings: Vec<ReferenceReading>) -> Self {
        Self { readings }
    }
}

impl ReferenceSource for FixedReferenceSource {
    fn latest_reading<'a>(
        &'a self,
        currency: &'a Currency,
        _at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Option<ReferenceReading>, PriceError>> {
        Box::pin(async move {
            Ok(self
                .readings
                .iter()
                .find(|reading| reading.currency == *currency)
                .cloned())
        })
    }
}
