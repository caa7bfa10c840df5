use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{AssetId, FetchError, PartitionId};

/// Asset id to quantity (raw) or asset id to USD value (valued).
pub type Balances = BTreeMap<AssetId, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    Success,
    Failed,
}

/// Terminal outcome of fetching and valuing one partition within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionResult {
    pub partition: PartitionId,
    pub status: PartitionStatus,
    pub raw_balances: Balances,
    pub usd_balances: Balances,
    pub usd_value: f64,
    pub attempts: u32,
    pub error: Option<FetchError>,
}

impl PartitionResult {
    pub fn succeeded(
        partition: PartitionId,
        raw_balances: Balances,
        usd_balances: Balances,
        usd_value: f64,
        attempts: u32,
    ) -> Self {
        Self {
            partition,
            status: PartitionStatus::Success,
            raw_balances,
            usd_balances,
            usd_value,
            attempts,
            error: None,
        }
    }

    pub fn failed(partition: PartitionId, error: FetchError, attempts: u32) -> Self {
        Self {
            partition,
            status: PartitionStatus::Failed,
            raw_balances: Balances::new(),
            usd_balances: Balances::new(),
            usd_value: 0.0,
            attempts,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PartitionStatus::Success
    }
}
