use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatePolicy;
use crate::fallback::ValidityWindow;
use crate::reference::DEFAULT_REFERENCE_STALENESS_SECS;
use crate::{Backoff, RetryPolicy, ValidationError};

/// Run-level engine configuration.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Total adapter attempts per partition, including the first. At least 1.
    pub max_retries: u32,
    /// Maximum age of a fallback candidate.
    pub staleness_limit_seconds: u64,
    /// Maximum share a fallback (or tolerated omission) may have; `0 < x < 1`.
    pub materiality_limit: f64,
    pub tolerate_omissions: bool,
    pub timeout_per_attempt_ms: u64,
    pub break_if_total_is_zero: bool,
    /// Maximum age of an oracle reading.
    pub reference_staleness_seconds: u64,
    pub bucket_seconds: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            staleness_limit_seconds: 3 * 60 * 60,
            materiality_limit: 0.05,
            tolerate_omissions: false,
            timeout_per_attempt_ms: 30_000,
            break_if_total_is_zero: false,
            reference_staleness_seconds: DEFAULT_REFERENCE_STALENESS_SECS,
            bucket_seconds: 3600,
            backoff_base_ms: 200,
            backoff_max_ms: 3_000,
            backoff_jitter: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_retries < 1 {
            return Err(invalid("max_retries", "must be at least 1"));
        }
        if self.staleness_limit_seconds == 0 {
            return Err(invalid("staleness_limit_seconds", "must be greater than zero"));
        }
        if !(self.materiality_limit > 0.0 && self.materiality_limit < 1.0) {
            return Err(invalid(
                "materiality_limit",
                format!("must be strictly between 0 and 1, got {}", self.materiality_limit),
            ));
        }
        if self.timeout_per_attempt_ms == 0 {
            return Err(invalid("timeout_per_attempt_ms", "must be greater than zero"));
        }
        if self.reference_staleness_seconds == 0 {
            return Err(invalid(
                "reference_staleness_seconds",
                "must be greater than zero",
            ));
        }
        if self.bucket_seconds == 0 {
            return Err(invalid("bucket_seconds", "must be greater than zero"));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(invalid(
                "backoff_max_ms",
                "must not be smaller than backoff_base_ms",
            ));
        }
        Ok(())
    }

    pub fn window(&self) -> ValidityWindow {
        ValidityWindow {
            staleness_limit_secs: self.staleness_limit_seconds,
            materiality_limit: self.materiality_limit,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = if self.backoff_base_ms == 0 {
            Backoff::None
        } else {
            Backoff::Exponential {
                base: Duration::from_millis(self.backoff_base_ms),
                factor: 2.0,
                max: Duration::from_millis(self.backoff_max_ms),
                jitter: self.backoff_jitter,
            }
        };
        RetryPolicy::new(self.max_retries, backoff)
    }

    pub fn aggregate_policy(&self) -> AggregatePolicy {
        AggregatePolicy {
            tolerate_omissions: self.tolerate_omissions,
            materiality_limit: self.materiality_limit,
            break_if_total_is_zero: self.break_if_total_is_zero,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_per_attempt_ms)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidConfig {
        field,
        reason: reason.into(),
    }
}
