//! Deciding whether a failed partition may reuse a previously persisted value.
//!
//! A candidate is admitted only when it is fresh (age within the staleness
//! limit, measured against the run timestamp) and immaterial: its share
//! `value / (confirmed_total + value)` of the entity must not exceed the
//! materiality limit. Each decision looks only at the live confirmed total,
//! so decisions for distinct partitions are independent of one another.

use std::fmt::{Display, Formatter};

use serde::Serialize;

use crate::gate::{self, age_secs, Observation};
use crate::{Balances, PartitionId, Snapshot, UtcDateTime};

/// Staleness and materiality limits for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidityWindow {
    pub staleness_limit_secs: u64,
    /// Exclusive bounds `0 < limit < 1`.
    pub materiality_limit: f64,
}

impl Default for ValidityWindow {
    fn default() -> Self {
        Self {
            staleness_limit_secs: 3 * 60 * 60,
            materiality_limit: 0.05,
        }
    }
}

/// One partition's slice of a prior snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackCandidate {
    pub partition: PartitionId,
    pub value: f64,
    /// When the value was last observed live.
    pub snapshot_at: UtcDateTime,
    pub balances: Balances,
    pub usd_balances: Balances,
}

impl FallbackCandidate {
    /// Extracts `partition`'s slice from `snapshot`, if the snapshot holds a value for it.
    pub fn from_snapshot(snapshot: &Snapshot, partition: &PartitionId) -> Option<Self> {
        let value = *snapshot.per_partition_usd.get(partition)?;
        let snapshot_at = snapshot.observed_at(partition)?;
        Some(Self {
            partition: partition.clone(),
            value,
            snapshot_at,
            balances: snapshot
                .per_asset_balances
                .get(partition)
                .cloned()
                .unwrap_or_default(),
            usd_balances: snapshot
                .per_asset_usd_balances
                .get(partition)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

impl FallbackCandidate {
    /// The candidate as a gate reading. Cached slices carry no round sequence.
    pub fn observation(&self) -> Observation {
        Observation {
            value: self.value,
            produced_at: self.snapshot_at,
            sequence: None,
        }
    }
}

/// A candidate that passed both checks.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmittedFallback {
    pub candidate: FallbackCandidate,
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    NoHistory,
    HistoryUnavailable { message: String },
    Invalid { message: String },
    Stale { age_secs: u64, limit_secs: u64 },
    Material { value: f64, share: f64, limit: f64 },
}

impl Display for DenyReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoHistory => f.write_str("no-history"),
            Self::HistoryUnavailable { message } => {
                write!(f, "history-unavailable: {message}")
            }
            Self::Invalid { message } => write!(f, "invalid cached value: {message}"),
            Self::Stale {
                age_secs,
                limit_secs,
            } => write!(f, "stale: cached value is {age_secs}s old, limit is {limit_secs}s"),
            Self::Material {
                value,
                share,
                limit,
            } => write!(
                f,
                "material: cached value {value} would be {:.2}% of the total, limit is {:.2}%",
                share * 100.0,
                limit * 100.0
            ),
        }
    }
}

/// A refused fallback. `prior_value` is the candidate's value when one existed,
/// so later policy can still reason about the omitted partition's size.
#[derive(Debug, Clone, PartialEq)]
pub struct Denial {
    pub reason: DenyReason,
    pub prior_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackDecision {
    Admit(AdmittedFallback),
    Deny(Denial),
}

impl FallbackDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit(_))
    }

    pub fn denied(reason: DenyReason) -> Self {
        Self::Deny(Denial {
            reason,
            prior_value: None,
        })
    }
}

/// `value / (confirmed_total + value)`, or 0 when both are zero.
pub fn materiality_share(value: f64, confirmed_total: f64) -> f64 {
    let denominator = confirmed_total + value;
    if denominator <= 0.0 {
        0.0
    } else {
        value / denominator
    }
}

pub fn decide(
    partition: &PartitionId,
    candidate: Option<&FallbackCandidate>,
    confirmed_total: f64,
    window: &ValidityWindow,
    now: UtcDateTime,
) -> FallbackDecision {
    let Some(candidate) = candidate else {
        return FallbackDecision::denied(DenyReason::NoHistory);
    };

    if candidate.partition != *partition {
        return FallbackDecision::denied(DenyReason::Invalid {
            message: format!(
                "candidate belongs to partition '{}', not '{partition}'",
                candidate.partition
            ),
        });
    }

    if let Err(rejection) = gate::check_non_negative_value(candidate.value) {
        return FallbackDecision::denied(DenyReason::Invalid {
            message: rejection.to_string(),
        });
    }

    let deny = |reason| {
        FallbackDecision::Deny(Denial {
            reason,
            prior_value: Some(candidate.value),
        })
    };

    let observation = candidate.observation();
    if gate::check_age(observation.produced_at, window.staleness_limit_secs, now).is_err() {
        return deny(DenyReason::Stale {
            age_secs: age_secs(observation.produced_at, now),
            limit_secs: window.staleness_limit_secs,
        });
    }

    let share = materiality_share(candidate.value, confirmed_total);
    if gate::check_non_negative_value(confirmed_total).is_err() || !share.is_finite() {
        return deny(DenyReason::Invalid {
            message: format!("confirmed total {confirmed_total} cannot weigh materiality"),
        });
    }
    if share > window.materiality_limit {
        return deny(DenyReason::Material {
            value: candidate.value,
            share,
            limit: window.materiality_limit,
        });
    }

    FallbackDecision::Admit(AdmittedFallback {
        candidate: candidate.clone(),
        share,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn polygon() -> PartitionId {
        PartitionId::parse("polygon").expect("valid partition")
    }

    fn candidate(value: f64, age_secs: i64) -> FallbackCandidate {
        FallbackCandidate {
            partition: polygon(),
            value,
            snapshot_at: UtcDateTime::from_unix(NOW - age_secs).expect("in range"),
            balances: Balances::new(),
            usd_balances: Balances::new(),
        }
    }

    fn now() -> UtcDateTime {
        UtcDateTime::from_unix(NOW).expect("in range")
    }

    #[test]
    fn no_candidate_is_no_history() {
        let decision = decide(&polygon(), None, 100.0, &ValidityWindow::default(), now());
        match decision {
            FallbackDecision::Deny(denial) => {
                assert_eq!(denial.reason, DenyReason::NoHistory);
                assert_eq!(denial.reason.to_string(), "no-history");
                assert_eq!(denial.prior_value, None);
            }
            FallbackDecision::Admit(_) => panic!("must deny"),
        }
    }

    #[test]
    fn fresh_immaterial_candidate_is_admitted() {
        let decision = decide(
            &polygon(),
            Some(&candidate(4.0, 3600)),
            100.0,
            &ValidityWindow::default(),
            now(),
        );
        match decision {
            FallbackDecision::Admit(admitted) => {
                assert_eq!(admitted.candidate.value, 4.0);
                assert!((admitted.share - 4.0 / 104.0).abs() < 1e-12);
            }
            FallbackDecision::Deny(denial) => panic!("unexpected denial: {}", denial.reason),
        }
    }

    #[test]
    fn stale_candidate_is_denied_with_prior_value() {
        let decision = decide(
            &polygon(),
            Some(&candidate(4.0, 3 * 3600 + 1)),
            100.0,
            &ValidityWindow::default(),
            now(),
        );
        match decision {
            FallbackDecision::Deny(denial) => {
                assert!(matches!(denial.reason, DenyReason::Stale { .. }));
                assert_eq!(denial.prior_value, Some(4.0));
            }
            FallbackDecision::Admit(_) => panic!("must deny"),
        }
    }

    #[test]
    fn material_candidate_is_denied() {
        let decision = decide(
            &polygon(),
            Some(&candidate(10.0, 60)),
            100.0,
            &ValidityWindow::default(),
            now(),
        );
        assert!(matches!(
            decision,
            FallbackDecision::Deny(Denial {
                reason: DenyReason::Material { .. },
                ..
            })
        ));
    }

    #[test]
    fn share_exactly_at_limit_is_admitted() {
        // 5 / (95 + 5) = 0.05
        let decision = decide(
            &polygon(),
            Some(&candidate(5.0, 60)),
            95.0,
            &ValidityWindow::default(),
            now(),
        );
        assert!(decision.is_admitted());
    }

    #[test]
    fn zero_candidate_has_zero_share() {
        assert_eq!(materiality_share(0.0, 0.0), 0.0);
        let decision = decide(
            &polygon(),
            Some(&candidate(0.0, 60)),
            0.0,
            &ValidityWindow::default(),
            now(),
        );
        assert!(decision.is_admitted());
    }

    #[test]
    fn negative_or_nan_candidates_are_invalid() {
        for value in [-1.0, f64::NAN] {
            let decision = decide(
                &polygon(),
                Some(&candidate(value, 60)),
                100.0,
                &ValidityWindow::default(),
                now(),
            );
            assert!(matches!(
                decision,
                FallbackDecision::Deny(Denial {
                    reason: DenyReason::Invalid { .. },
                    prior_value: None
                })
            ));
        }
    }

    #[test]
    fn candidate_with_only_other_partitions_confirmed_zero_is_material() {
        let decision = decide(
            &polygon(),
            Some(&candidate(4.0, 60)),
            0.0,
            &ValidityWindow::default(),
            now(),
        );
        assert!(!decision.is_admitted());
    }

    #[test]
    fn unusable_confirmed_total_denies_instead_of_admitting() {
        for confirmed in [f64::NAN, f64::INFINITY, -40.0] {
            let decision = decide(
                &polygon(),
                Some(&candidate(4.0, 60)),
                confirmed,
                &ValidityWindow::default(),
                now(),
            );
            match decision {
                FallbackDecision::Deny(denial) => {
                    assert!(matches!(denial.reason, DenyReason::Invalid { .. }));
                    assert_eq!(denial.prior_value, Some(4.0));
                }
                FallbackDecision::Admit(_) => panic!("confirmed total {confirmed} must not admit"),
            }
        }
    }

    #[test]
    fn candidate_reads_as_an_unsequenced_observation() {
        let observation = candidate(4.0, 3600).observation();

        assert_eq!(observation.value, 4.0);
        assert_eq!(observation.produced_at.unix_timestamp(), NOW - 3600);
        assert!(observation.sequence.is_none());
    }
}
