//! JSON fixture that stands in for live adapters, prices and the oracle.
//!
//! ```json
//! {
//!   "entity": { "id": "ledgity", "partitions": ["ethereum", "polygon"] },
//!   "timestamp": "2024-01-01T00:00:00Z",
//!   "balances": { "ethereum": { "usdc": 100.0 } },
//!   "failing_partitions": { "polygon": "RPC Failed for Polygon" },
//!   "prices": { "usdc": { "value": 1.0, "currency": "USD" } },
//!   "readings": []
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chainvalue_core::{
    AssetId, Balances, Currency, Entity, FetchError, FixedPartitionSource, FixedPriceSource,
    FixedReferenceSource, PartitionId, ReferenceReading, SourceRegistry, UnitPrice, UtcDateTime,
};
use serde::Deserialize;

use crate::error::CliError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fixture {
    pub entity: Entity,
    /// Run time; the current time when absent.
    pub timestamp: Option<UtcDateTime>,
    #[serde(default)]
    pub balances: BTreeMap<PartitionId, Balances>,
    /// Partitions whose adapter fails with a transport error, and its message.
    #[serde(default)]
    pub failing_partitions: BTreeMap<PartitionId, String>,
    #[serde(default)]
    pub prices: BTreeMap<AssetId, UnitPrice>,
    #[serde(default)]
    pub readings: Vec<ReferenceReading>,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|error| CliError::Fixture(format!("{}: {error}", path.display())))
    }

    pub fn at(&self) -> UtcDateTime {
        self.timestamp.unwrap_or_else(UtcDateTime::now)
    }

    /// One fixed adapter registered for every partition of the entity.
    pub fn registry(&self) -> SourceRegistry {
        let mut source = FixedPartitionSource::new();
        for (partition, balances) in &self.balances {
            source = source.with_balances(partition.clone(), balances.clone());
        }
        for (partition, message) in &self.failing_partitions {
            source = source.with_failure(partition.clone(), FetchError::transport(message.clone()));
        }

        let mut registry = SourceRegistry::new();
        registry.register_all(self.entity.partitions().iter().cloned(), Arc::new(source));
        registry
    }

    pub fn prices(&self) -> FixedPriceSource {
        self.prices
            .iter()
            .fold(FixedPriceSource::new(), |prices, (asset, price)| {
                prices.with_price(asset.clone(), price.clone())
            })
    }

    /// The oracle and the non-USD currencies the fixture prices in, if any.
    pub fn reference(&self) -> Option<(FixedReferenceSource, Vec<Currency>)> {
        let mut currencies: Vec<Currency> = self
            .prices
            .values()
            .map(|price| price.currency.clone())
            .filter(|currency| !currency.is_usd())
            .collect();
        currencies.sort();
        currencies.dedup();

        if currencies.is_empty() {
            return None;
        }
        Some((FixedReferenceSource::new(self.readings.clone()), currencies))
    }
}
