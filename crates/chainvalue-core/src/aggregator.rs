use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::fallback::{materiality_share, FallbackDecision};
use crate::gate;
use crate::{
    Balances, Diagnostic, Entity, EntityId, PartitionId, PartitionResult, Provenance, UtcDateTime,
};

/// Why an aggregate is not committable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationFailure {
    /// At least one partition has neither a live value nor an admitted fallback,
    /// and policy does not tolerate the omission.
    Omissions,
    /// The total is exactly zero and policy treats that as a failure.
    ZeroTotal,
}

impl AggregationFailure {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Omissions => "omissions",
            Self::ZeroTotal => "zero_total",
        }
    }
}

impl Display for AggregationFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Omissions => f.write_str("unresolved partitions"),
            Self::ZeroTotal => f.write_str("total is zero"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatePolicy {
    pub tolerate_omissions: bool,
    pub materiality_limit: f64,
    pub break_if_total_is_zero: bool,
}

impl Default for AggregatePolicy {
    fn default() -> Self {
        Self {
            tolerate_omissions: false,
            materiality_limit: 0.05,
            break_if_total_is_zero: false,
        }
    }
}

/// One partition's contribution to the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionLine {
    pub partition: PartitionId,
    pub provenance: Provenance,
    /// `None` for omitted partitions.
    pub usd_value: Option<f64>,
    pub balances: Balances,
    pub usd_balances: Balances,
    pub attempts: u32,
    /// Failure and fallback explanation for non-live partitions.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateOutcome {
    pub entity_id: EntityId,
    pub timestamp: UtcDateTime,
    pub total_usd: f64,
    pub lines: Vec<PartitionLine>,
    pub success: bool,
    pub failure: Option<AggregationFailure>,
    pub diagnostics: Vec<Diagnostic>,
    /// Combined prior-known share of omitted partitions; `None` if any is unknown.
    pub omitted_share: Option<f64>,
}

impl AggregateOutcome {
    pub fn line(&self, partition: &PartitionId) -> Option<&PartitionLine> {
        self.lines.iter().find(|line| &line.partition == partition)
    }

    pub fn omitted(&self) -> impl Iterator<Item = &PartitionLine> {
        self.lines
            .iter()
            .filter(|line| line.provenance == Provenance::Omitted)
    }

    /// One-line summary of why the aggregate failed, naming each unresolved partition.
    pub fn failure_message(&self) -> Option<String> {
        let failure = self.failure?;
        if self.diagnostics.is_empty() {
            return Some(failure.to_string());
        }

        let details = self
            .diagnostics
            .iter()
            .map(|diagnostic| format!("{} ({})", diagnostic.partition, diagnostic.reason))
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!("{failure}: {details}"))
    }
}

/// The live value of a successful result, if it is finite and non-negative.
///
/// Anything else is handled as a failed partition and never summed.
pub fn confirmed_value(result: &PartitionResult) -> Option<f64> {
    (result.is_success() && gate::check_non_negative_value(result.usd_value).is_ok())
        .then_some(result.usd_value)
}

/// Sum of confirmed live values among `results`. This is the base for materiality.
pub fn confirmed_total(results: &BTreeMap<PartitionId, PartitionResult>) -> f64 {
    results.values().filter_map(confirmed_value).sum()
}

/// Merges live results and fallback decisions into one outcome.
///
/// Iterates the entity's partition set, so each partition yields exactly one
/// line whatever `results` and `decisions` contain.
pub fn aggregate(
    entity: &Entity,
    at: UtcDateTime,
    results: &BTreeMap<PartitionId, PartitionResult>,
    decisions: &BTreeMap<PartitionId, FallbackDecision>,
    policy: &AggregatePolicy,
) -> AggregateOutcome {
    let mut lines = Vec::with_capacity(entity.partitions().len());
    let mut diagnostics = Vec::new();
    let mut omitted_prior: Option<f64> = Some(0.0);

    for partition in entity.partitions() {
        let result = results.get(partition);
        let attempts = result.map(|result| result.attempts).unwrap_or(0);

        if let Some((result, value)) =
            result.and_then(|result| confirmed_value(result).map(|value| (result, value)))
        {
            lines.push(PartitionLine {
                partition: partition.clone(),
                provenance: Provenance::Live,
                usd_value: Some(value),
                balances: result.raw_balances.clone(),
                usd_balances: result.usd_balances.clone(),
                attempts,
                reason: None,
            });
            continue;
        }

        let failure = match result {
            Some(result) if result.is_success() => {
                format!("live value {} is not a valid amount", result.usd_value)
            }
            Some(result) => result
                .error
                .as_ref()
                .map_or_else(|| String::from("partition failed"), ToString::to_string),
            None => String::from("partition was not fetched"),
        };

        match decisions.get(partition) {
            Some(FallbackDecision::Admit(admitted)) => {
                lines.push(PartitionLine {
                    partition: partition.clone(),
                    provenance: Provenance::Fallback {
                        snapshot_at: admitted.candidate.snapshot_at,
                    },
                    usd_value: Some(admitted.candidate.value),
                    balances: admitted.candidate.balances.clone(),
                    usd_balances: admitted.candidate.usd_balances.clone(),
                    attempts,
                    reason: Some(failure),
                });
            }
            decision => {
                let (denial, prior_value) = match decision {
                    Some(FallbackDecision::Deny(denial)) => {
                        (denial.reason.to_string(), denial.prior_value)
                    }
                    _ => (String::from("no fallback decision was made"), None),
                };
                let reason = format!("{failure}; fallback denied: {denial}");

                omitted_prior = match (omitted_prior, prior_value) {
                    (Some(sum), Some(value)) => Some(sum + value),
                    _ => None,
                };

                diagnostics.push(Diagnostic {
                    partition: partition.clone(),
                    reason: reason.clone(),
                });
                lines.push(PartitionLine {
                    partition: partition.clone(),
                    provenance: Provenance::Omitted,
                    usd_value: None,
                    balances: Balances::new(),
                    usd_balances: Balances::new(),
                    attempts,
                    reason: Some(reason),
                });
            }
        }
    }

    let total_usd: f64 = lines.iter().filter_map(|line| line.usd_value).sum();

    let omitted_share = if diagnostics.is_empty() {
        Some(0.0)
    } else {
        omitted_prior.map(|prior| materiality_share(prior, total_usd))
    };

    let omissions_acceptable = diagnostics.is_empty()
        || (policy.tolerate_omissions
            && omitted_share.is_some_and(|share| share <= policy.materiality_limit));

    let failure = if !omissions_acceptable {
        Some(AggregationFailure::Omissions)
    } else if policy.break_if_total_is_zero && total_usd == 0.0 {
        Some(AggregationFailure::ZeroTotal)
    } else {
        None
    };

    AggregateOutcome {
        entity_id: entity.id.clone(),
        timestamp: at,
        total_usd,
        lines,
        success: failure.is_none(),
        failure,
        diagnostics,
        omitted_share,
    }
}
