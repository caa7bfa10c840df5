//! Pricing raw balances and converting them to USD.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::gate::Verdict;
use crate::{
    Balances, Currency, FetchError, PriceSource, ReferenceReading, ReferenceSource, UnitPrice,
    UtcDateTime,
};

/// A currency whose reference reading was not admitted into the [`RateBook`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateRejection {
    pub currency: Currency,
    pub reason: String,
}

/// Conversion rates to USD that passed the validity gate.
///
/// USD itself always converts at 1.0; any other currency converts only if a
/// reading for it was admitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateBook {
    rates: BTreeMap<Currency, f64>,
}

impl RateBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `reading` through the gate and keeps its rate if accepted.
    pub fn admit(
        &mut self,
        reading: &ReferenceReading,
        staleness_limit_secs: u64,
        now: UtcDateTime,
    ) -> Verdict {
        let verdict = reading.validate(staleness_limit_secs, now);
        if verdict.is_accepted() {
            self.rates.insert(reading.currency.clone(), reading.value());
        }
        verdict
    }

    /// Queries `source` for every currency and admits what passes the gate.
    pub async fn load(
        source: &dyn ReferenceSource,
        currencies: &[Currency],
        staleness_limit_secs: u64,
        now: UtcDateTime,
    ) -> (Self, Vec<RateRejection>) {
        let mut book = Self::new();
        let mut rejections = Vec::new();

        for currency in currencies.iter().filter(|currency| !currency.is_usd()) {
            let reason = match source.latest_reading(currency, now).await {
                Ok(Some(reading)) if reading.currency != *currency => format!(
                    "oracle answered for {} when asked for {currency}",
                    reading.currency
                ),
                Ok(Some(reading)) => match book.admit(&reading, staleness_limit_secs, now) {
                    Verdict::Accepted => {
                        debug!(currency = %currency, rate = reading.value(), "reference rate accepted");
                        continue;
                    }
                    Verdict::Rejected(rejection) => rejection.to_string(),
                },
                Ok(None) => String::from("oracle has no feed for this currency"),
                Err(error) => format!("oracle unavailable: {error}"),
            };

            warn!(currency = %currency, reason = %reason, "reference rate rejected");
            rejections.push(RateRejection {
                currency: currency.clone(),
                reason,
            });
        }

        (book, rejections)
    }

    pub fn rate(&self, currency: &Currency) -> Option<f64> {
        if currency.is_usd() {
            return Some(1.0);
        }
        self.rates.get(currency).copied()
    }

    /// USD value of one unit at `price`, if its currency has a validated rate.
    pub fn to_usd(&self, price: &UnitPrice) -> Option<f64> {
        self.rate(&price.currency).map(|rate| price.value * rate)
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

/// Per-asset USD values and their sum for one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Valuation {
    pub usd_balances: Balances,
    pub total_usd: f64,
}

/// Prices every non-zero balance and converts it to USD.
///
/// A price service error keeps its retryability. A price in a currency with
/// no validated rate is a non-retryable conversion failure. A total that is
/// negative or not finite is rejected as an invalid value.
pub async fn value_balances(
    prices: &dyn PriceSource,
    rates: &RateBook,
    raw: &Balances,
    at: UtcDateTime,
) -> Result<Valuation, FetchError> {
    let mut usd_balances = Balances::new();
    let mut total_usd = 0.0;

    for (asset, quantity) in raw {
        if *quantity == 0.0 {
            continue;
        }

        let price = prices
            .price(asset, at)
            .await
            .map_err(|error| FetchError::price_unavailable(asset, &error))?;

        if !price.value.is_finite() || price.value < 0.0 {
            return Err(FetchError::invalid_value(format!(
                "price {} for asset '{asset}' is not a non-negative number",
                price.value
            )));
        }

        let unit_usd = rates
            .to_usd(&price)
            .ok_or_else(|| FetchError::conversion_unavailable(&price.currency))?;

        let value = quantity * unit_usd;
        total_usd += value;
        usd_balances.insert(asset.clone(), value);
    }

    if !total_usd.is_finite() || total_usd < 0.0 {
        return Err(FetchError::invalid_value(format!(
            "partition value {total_usd} is not a non-negative number"
        )));
    }

    Ok(Valuation {
        usd_balances,
        total_usd,
    })
}
