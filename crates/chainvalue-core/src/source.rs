//! Capability traits for the engine's external collaborators.
//!
//! | Trait | Input | Output | Description |
//! |-------|-------|--------|-------------|
//! | [`PartitionSource`] | partition, time | [`Balances`] | Raw per-partition asset balances |
//! | [`PriceSource`] | asset, time | [`UnitPrice`] | Unit price in some reference currency |
//! | [`ReferenceSource`] | currency, time | [`ReferenceReading`] | Oracle reading for a currency → USD rate |
//!
//! Partition sources are resolved through an explicit [`SourceRegistry`]
//! handed to the runner; each registration owns its own [`CircuitBreaker`].

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    AssetId, Balances, CircuitBreaker, CircuitBreakerConfig, Currency, PartitionId,
    ReferenceReading, UtcDateTime,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Partition-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Transport,
    Timeout,
    CircuitOpen,
    Malformed,
    PriceUnavailable,
    ConversionUnavailable,
    InvalidValue,
    SourceNotRegistered,
    Cancelled,
    Internal,
}

/// Structured error for one partition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchError {
    kind: FetchErrorKind,
    message: String,
    retryable: bool,
}

impl FetchError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Transport,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            kind: FetchErrorKind::Timeout,
            message: format!("attempt timed out after {timeout_ms}ms"),
            retryable: true,
        }
    }

    pub fn circuit_open(partition: &PartitionId) -> Self {
        Self {
            kind: FetchErrorKind::CircuitOpen,
            message: format!("circuit breaker for partition '{partition}' is open"),
            retryable: true,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Malformed,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn price_unavailable(asset: &AssetId, cause: &PriceError) -> Self {
        Self {
            kind: FetchErrorKind::PriceUnavailable,
            message: format!("price for asset '{asset}' unavailable: {}", cause.message()),
            retryable: cause.retryable(),
        }
    }

    pub fn conversion_unavailable(currency: &Currency) -> Self {
        Self {
            kind: FetchErrorKind::ConversionUnavailable,
            message: format!("no validated {currency}/USD rate is available"),
            retryable: false,
        }
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::InvalidValue,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn source_not_registered(partition: &PartitionId) -> Self {
        Self {
            kind: FetchErrorKind::SourceNotRegistered,
            message: format!("no source is registered for partition '{partition}'"),
            retryable: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FetchErrorKind::Cancelled,
            message: String::from("run was cancelled before the partition resolved"),
            retryable: false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Internal,
            message: message.into(),
            retryable: false,
        }
    }

    pub const fn kind(&self) -> FetchErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    /// True for failures that say something about the source's health.
    ///
    /// Valuation and cancellation failures do not count against a breaker.
    pub const fn counts_against_source(&self) -> bool {
        matches!(
            self.kind,
            FetchErrorKind::Transport | FetchErrorKind::Timeout | FetchErrorKind::Malformed
        )
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            FetchErrorKind::Transport => "fetch.transport",
            FetchErrorKind::Timeout => "fetch.timeout",
            FetchErrorKind::CircuitOpen => "fetch.circuit_open",
            FetchErrorKind::Malformed => "fetch.malformed",
            FetchErrorKind::PriceUnavailable => "fetch.price_unavailable",
            FetchErrorKind::ConversionUnavailable => "fetch.conversion_unavailable",
            FetchErrorKind::InvalidValue => "fetch.invalid_value",
            FetchErrorKind::SourceNotRegistered => "fetch.source_not_registered",
            FetchErrorKind::Cancelled => "fetch.cancelled",
            FetchErrorKind::Internal => "fetch.internal",
        }
    }
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for FetchError {}

/// Failure reported by a price or reference source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceError {
    message: String,
    retryable: bool,
}

impl PriceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }
}

impl Display for PriceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PriceError {}

/// Price of one unit of an asset, denominated in `currency`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitPrice {
    pub value: f64,
    pub currency: Currency,
}

impl UnitPrice {
    pub fn usd(value: f64) -> Self {
        Self {
            value,
            currency: Currency::usd(),
        }
    }
}

/// Raw per-partition balance fetcher.
///
/// Calls must be safe to retry. Transport problems should be reported as
/// [`FetchError::transport`], unparseable answers as [`FetchError::malformed`].
pub trait PartitionSource: Send + Sync {
    fn fetch<'a>(
        &'a self,
        partition: &'a PartitionId,
        at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Balances, FetchError>>;
}

/// Asset price lookup.
pub trait PriceSource: Send + Sync {
    fn price<'a>(
        &'a self,
        asset: &'a AssetId,
        at: UtcDateTime,
    ) -> BoxFuture<'a, Result<UnitPrice, PriceError>>;
}

/// Oracle returning the latest reading for a currency's USD rate.
///
/// `Ok(None)` means the oracle has no feed for the currency.
pub trait ReferenceSource: Send + Sync {
    fn latest_reading<'a>(
        &'a self,
        currency: &'a Currency,
        at: UtcDateTime,
    ) -> BoxFuture<'a, Result<Option<ReferenceReading>, PriceError>>;
}

/// A registered partition source and the breaker guarding it.
#[derive(Clone)]
pub struct RegisteredSource {
    pub source: Arc<dyn PartitionSource>,
    pub breaker: Arc<CircuitBreaker>,
}

/// Explicit partition id → source mapping.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    entries: HashMap<PartitionId, RegisteredSource>,
    breaker_config: CircuitBreakerConfig,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose future registrations use `config` for their breakers.
    pub fn with_breaker_config(config: CircuitBreakerConfig) -> Self {
        Self {
            entries: HashMap::new(),
            breaker_config: config,
        }
    }

    /// Registers `source` for `partition`, replacing any previous registration.
    pub fn register(&mut self, partition: PartitionId, source: Arc<dyn PartitionSource>) {
        let breaker = Arc::new(CircuitBreaker::new(self.breaker_config));
        self.entries
            .insert(partition, RegisteredSource { source, breaker });
    }

    /// Registers one shared source for several partitions; each gets its own breaker.
    pub fn register_all<I>(&mut self, partitions: I, source: Arc<dyn PartitionSource>)
    where
        I: IntoIterator<Item = PartitionId>,
    {
        for partition in partitions {
            self.register(partition, Arc::clone(&source));
        }
    }

    pub fn get(&self, partition: &PartitionId) -> Option<&RegisteredSource> {
        self.entries.get(partition)
    }

    pub fn contains(&self, partition: &PartitionId) -> bool {
        self.entries.contains_key(partition)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut partitions: Vec<&str> = self.entries.keys().map(PartitionId::as_str).collect();
        partitions.sort_unstable();
        f.debug_struct("SourceRegistry")
            .field("partitions", &partitions)
            .finish()
    }
}
