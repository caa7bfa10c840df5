use thiserror::Error;

/// Validation and contract errors exposed by `chainvalue-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{kind} id cannot be empty")]
    EmptyId { kind: &'static str },
    #[error("{kind} id length {len} exceeds max {max}")]
    IdTooLong {
        kind: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{kind} id contains invalid character '{ch}' at index {index}")]
    IdInvalidChar {
        kind: &'static str,
        ch: char,
        index: usize,
    },

    #[error("currency must be a 3-letter uppercase ISO code: '{value}'")]
    InvalidCurrency { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("unix timestamp {value} is out of range")]
    TimestampOutOfRange { value: i64 },

    #[error("entity must declare at least one partition")]
    EmptyPartitionSet,
    #[error("partition '{partition}' is declared more than once")]
    DuplicatePartition { partition: String },

    #[error("config field '{field}' {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

/// Errors surfaced by a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store payload could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

/// Why a snapshot commit did not reach the store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("refusing to persist an unsuccessful aggregate for entity '{entity}'")]
    NotCommittable { entity: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Top-level error type for engine construction and run supervision.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("run {run_id} aborted before producing a report: {message}")]
    RunAborted { run_id: uuid::Uuid, message: String },
}
