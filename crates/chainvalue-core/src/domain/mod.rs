//! # Domain Models
//!
//! Canonical domain types for chainvalue.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Entity`] | Tracked entity with its partition set |
//! | [`EntityId`], [`PartitionId`], [`AssetId`] | Validated identifiers |
//! | [`Currency`] | 3-letter reference currency code |
//! | [`PartitionResult`] | Terminal per-partition outcome of a run |
//! | [`Snapshot`] | Persisted aggregate keyed by entity and time bucket |
//! | [`Provenance`] | Live, fallback or omitted origin of a partition value |
//! | [`FailureRecord`] | Diagnostics for a run that produced no snapshot |
//! | [`UtcDateTime`] | UTC timestamp |
//!
//! All identifiers validate at construction and on deserialization, so an
//! invalid id never reaches the engine.

mod entity;
mod ids;
mod partition;
mod snapshot;
mod timestamp;

pub use entity::Entity;
pub use ids::{AssetId, Currency, EntityId, PartitionId};
pub use partition::{Balances, PartitionResult, PartitionStatus};
pub use snapshot::{Diagnostic, FailureRecord, Provenance, Snapshot};
pub use timestamp::UtcDateTime;
