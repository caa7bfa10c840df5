//! Freshness and validity gate for timestamped external readings.
//!
//! [`validate`] applies three rules in order and reports the first one that
//! fails:
//!
//! | # | Rule | Rejection |
//! |---|------|-----------|
//! | 1 | value is finite and strictly positive | [`Rejection::NonFiniteValue`], [`Rejection::NonPositiveValue`] |
//! | 2 | sequence (if exposed) is non-zero and answered in the same or a later round | [`Rejection::ZeroSequence`], [`Rejection::CarriedForwardRound`] |
//! | 3 | age is within the staleness limit | [`Rejection::Stale`] |
//!
//! The rules are also exposed individually so callers with different value
//! semantics (cached snapshot slices may legitimately be zero) can compose
//! their own subset. Readings dated after `now` have age zero.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::UtcDateTime;

/// Claimed round and the round in which the answer was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    pub claimed: u128,
    pub answered_in: u128,
}

/// Common shape of anything the gate can judge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub value: f64,
    pub produced_at: UtcDateTime,
    pub sequence: Option<Sequence>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rejection {
    NonFiniteValue,
    NonPositiveValue { value: f64 },
    NegativeValue { value: f64 },
    ZeroSequence,
    CarriedForwardRound { claimed: u128, answered_in: u128 },
    Stale { age_secs: u64, limit_secs: u64 },
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonFiniteValue => f.write_str("value is not a finite number"),
            Self::NonPositiveValue { value } => write!(f, "value {value} is not strictly positive"),
            Self::NegativeValue { value } => write!(f, "value {value} is negative"),
            Self::ZeroSequence => f.write_str("round id is zero"),
            Self::CarriedForwardRound {
                claimed,
                answered_in,
            } => write!(
                f,
                "answer for round {claimed} was carried forward from round {answered_in}"
            ),
            Self::Stale {
                age_secs,
                limit_secs,
            } => write!(f, "reading is {age_secs}s old, limit is {limit_secs}s"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Accepted => None,
            Self::Rejected(rejection) => Some(rejection),
        }
    }
}

impl From<Result<(), Rejection>> for Verdict {
    fn from(value: Result<(), Rejection>) -> Self {
        match value {
            Ok(()) => Self::Accepted,
            Err(rejection) => Self::Rejected(rejection),
        }
    }
}

/// Runs every rule against `observation`.
pub fn validate(observation: &Observation, staleness_limit_secs: u64, now: UtcDateTime) -> Verdict {
    let outcome = check_positive_value(observation.value)
        .and_then(|()| match observation.sequence {
            Some(sequence) => check_sequence(sequence),
            None => Ok(()),
        })
        .and_then(|()| check_age(observation.produced_at, staleness_limit_secs, now));
    outcome.into()
}

pub fn check_positive_value(value: f64) -> Result<(), Rejection> {
    if !value.is_finite() {
        return Err(Rejection::NonFiniteValue);
    }
    if value <= 0.0 {
        return Err(Rejection::NonPositiveValue { value });
    }
    Ok(())
}

pub fn check_non_negative_value(value: f64) -> Result<(), Rejection> {
    if !value.is_finite() {
        return Err(Rejection::NonFiniteValue);
    }
    if value < 0.0 {
        return Err(Rejection::NegativeValue { value });
    }
    Ok(())
}

pub fn check_sequence(sequence: Sequence) -> Result<(), Rejection> {
    if sequence.claimed == 0 {
        return Err(Rejection::ZeroSequence);
    }
    if sequence.answered_in < sequence.claimed {
        return Err(Rejection::CarriedForwardRound {
            claimed: sequence.claimed,
            answered_in: sequence.answered_in,
        });
    }
    Ok(())
}

/// Age in whole seconds, clamped at zero for readings dated in the future.
pub fn age_secs(produced_at: UtcDateTime, now: UtcDateTime) -> u64 {
    u64::try_from(now.seconds_since(produced_at)).unwrap_or(0)
}

pub fn check_age(
    produced_at: UtcDateTime,
    staleness_limit_secs: u64,
    now: UtcDateTime,
) -> Result<(), Rejection> {
    let age = age_secs(produced_at, now);
    if age > staleness_limit_secs {
        return Err(Rejection::Stale {
            age_secs: age,
            limit_secs: staleness_limit_secs,
        });
    }
    Ok(())
}
