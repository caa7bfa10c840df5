use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::{FetchError, PartitionId};

/// Runtime circuit state for one partition source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    /// Rejecting attempts until the cool-down has elapsed.
    Open,
    /// One probe attempt is let through; its outcome closes or reopens the circuit.
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive source failures that open the circuit.
    pub failure_threshold: u32,
    /// Cool-down before a probe is allowed.
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Tally {
    state: CircuitState,
    failures_in_row: u32,
    opened_at: Option<Instant>,
}

/// Failure counter shared by every run that fetches one partition.
///
/// Only failures that say something about the source itself
/// ([`FetchError::counts_against_source`]) move the counter; pricing and
/// cancellation outcomes are ignored.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    tally: Mutex<Tally>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            tally: Mutex::new(Tally {
                state: CircuitState::Closed,
                failures_in_row: 0,
                opened_at: None,
            }),
        }
    }

    fn tally(&self) -> MutexGuard<'_, Tally> {
        self.tally
            .lock()
            .expect("circuit breaker lock is not poisoned")
    }

    /// Fails fast with a retryable [`FetchError::circuit_open`] while the circuit is open.
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and lets
    /// this attempt through as the probe.
    pub fn guard(&self, partition: &PartitionId) -> Result<(), FetchError> {
        let mut tally = self.tally();
        if tally.state != CircuitState::Open {
            return Ok(());
        }

        let cooled_down = tally
            .opened_at
            .is_some_and(|opened_at| opened_at.elapsed() >= self.config.open_timeout);
        if !cooled_down {
            return Err(FetchError::circuit_open(partition));
        }

        tally.state = CircuitState::HalfOpen;
        tally.opened_at = None;
        Ok(())
    }

    /// Feeds one adapter outcome into the breaker.
    pub fn record<T>(&self, outcome: &Result<T, FetchError>) {
        let mut tally = self.tally();
        match outcome {
            Ok(_) => {
                tally.state = CircuitState::Closed;
                tally.failures_in_row = 0;
                tally.opened_at = None;
            }
            Err(error) if error.counts_against_source() => {
                tally.failures_in_row = tally.failures_in_row.saturating_add(1);
                let trips = tally.state == CircuitState::HalfOpen
                    || tally.failures_in_row >= self.config.failure_threshold;
                if trips && tally.state != CircuitState::Open {
                    warn!(
                        failures = tally.failures_in_row,
                        code = error.code(),
                        "circuit opened"
                    );
                }
                if trips {
                    tally.state = CircuitState::Open;
                    tally.opened_at = Some(Instant::now());
                }
            }
            Err(_) => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.tally().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.tally().failures_in_row
    }
}
