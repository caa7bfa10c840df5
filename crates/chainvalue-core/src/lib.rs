//! # chainvalue Core
//!
//! Multi-source value aggregation with validated fallback recovery.
//!
//! ## Overview
//!
//! For one entity (a tracked protocol) the engine fetches independent
//! per-partition (per-chain) balances, values them in USD and sums them into
//! one snapshot. When a partition cannot be fetched it decides whether a
//! recent, immaterial value from a prior snapshot may stand in for it instead
//! of failing the whole computation.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`aggregator`] | Merges live values and admitted fallbacks; omission policy |
//! | [`cancel`] | Cooperative run cancellation |
//! | [`circuit_breaker`] | Per-source circuit breaker |
//! | [`config`] | Run-level configuration |
//! | [`domain`] | Ids, entities, partition results, snapshots |
//! | [`engine`] | Run orchestration and run handles |
//! | [`error`] | Core error types |
//! | [`fallback`] | Admit/deny decision for cached partition values |
//! | [`fixed`] | Fixture-backed sources |
//! | [`gate`] | Freshness and validity checks for external readings |
//! | [`reference`] | Oracle reference readings |
//! | [`retry`] | Attempt budget and backoff |
//! | [`runner`] | Concurrent bounded-retry partition fetching |
//! | [`source`] | Source capability traits and registry |
//! | [`store`] | Snapshot store trait and in-memory store |
//! | [`throttling`] | Shared request quota |
//! | [`valuation`] | Pricing and USD conversion |
//! | [`writer`] | Snapshot commit and failure reporting |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chainvalue_core::{CancelToken, EngineBuilder, MemoryStore, SourceRegistry};
//!
//! let mut registry = SourceRegistry::new();
//! registry.register(PartitionId::parse("ethereum")?, Arc::new(my_ethereum_adapter));
//!
//! let engine = EngineBuilder::new(registry, Arc::new(my_prices), Arc::new(MemoryStore::new()))
//!     .build()?;
//! let report = engine.run(&entity, UtcDateTime::now(), &CancelToken::new()).await;
//! println!("{}", serde_json::to_string_pretty(&report)?);
//! ```
//!
//! ## Error Handling
//!
//! Partition failures never escape the runner: they become failed
//! [`PartitionResult`]s carrying a [`FetchError`] whose
//! [`retryable`](FetchError::retryable) flag drives the retry loop. A run
//! always yields a [`RunReport`]; persistence problems are reported in it
//! separately from aggregation failures.

pub mod aggregator;
pub mod cancel;
pub mod circuit_breaker;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod fixed;
pub mod gate;
pub mod reference;
pub mod retry;
pub mod runner;
pub mod source;
pub mod store;
pub mod throttling;
pub mod valuation;
pub mod writer;

pub use aggregator::{AggregateOutcome, AggregatePolicy, AggregationFailure, PartitionLine};
pub use cancel::CancelToken;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::EngineConfig;
pub use domain::{
    AssetId, Balances, Currency, Diagnostic, Entity, EntityId, FailureRecord, PartitionId,
    PartitionResult, PartitionStatus, Provenance, Snapshot, UtcDateTime,
};
pub use engine::{Engine, EngineBuilder, Persistence, RunHandle, RunReport, RunStatus};
pub use error::{EngineError, PersistenceError, StoreError, ValidationError};
pub use fallback::{
    AdmittedFallback, Denial, DenyReason, FallbackCandidate, FallbackDecision, ValidityWindow,
};
pub use fixed::{FixedPartitionSource, FixedPriceSource, FixedReferenceSource};
pub use gate::{Observation, Rejection, Sequence, Verdict};
pub use reference::ReferenceReading;
pub use retry::{Backoff, RetryPolicy};
pub use runner::Runner;
pub use source::{
    FetchError, FetchErrorKind, PartitionSource, PriceError, PriceSource, ReferenceSource,
    SourceRegistry, UnitPrice,
};
pub use store::{MemoryStore, SnapshotStore, WriteDisposition};
pub use throttling::RequestThrottle;
pub use valuation::{RateBook, RateRejection};
pub use writer::{PersistedSnapshot, SnapshotWriter};
