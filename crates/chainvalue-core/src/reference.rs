use serde::{Deserialize, Serialize};

use crate::gate::{self, Observation, Sequence, Verdict};
use crate::{Currency, UtcDateTime};

/// Default oracle staleness limit: three hours.
pub const DEFAULT_REFERENCE_STALENESS_SECS: u64 = 3 * 60 * 60;

/// One `latestRoundData`-style oracle answer quoting `currency` in USD.
///
/// `answer` is a fixed-point integer scaled by `10^decimals`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceReading {
    pub currency: Currency,
    pub round_id: u128,
    pub answer: i128,
    pub decimals: u8,
    pub updated_at: UtcDateTime,
    pub answered_in_round: u128,
}

impl ReferenceReading {
    /// The answer as a float, e.g. `108000000` with 8 decimals is `1.08`.
    pub fn value(&self) -> f64 {
        self.answer as f64 / 10_f64.powi(i32::from(self.decimals))
    }

    pub fn observation(&self) -> Observation {
        Observation {
            value: self.value(),
            produced_at: self.updated_at,
            sequence: Some(Sequence {
                claimed: self.round_id,
                answered_in: self.answered_in_round,
            }),
        }
    }

    pub fn validate(&self, staleness_limit_secs: u64, now: UtcDateTime) -> Verdict {
        gate::validate(&self.observation(), staleness_limit_secs, now)
    }
}
