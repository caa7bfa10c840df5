use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{EntityId, PartitionId, ValidationError};

/// A tracked entity and the partitions its value is spread across.
///
/// The partition list is non-empty and duplicate-free; it is fixed for the
/// lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEntity")]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    partitions: Vec<PartitionId>,
}

impl Entity {
    pub fn new(
        id: EntityId,
        name: impl Into<String>,
        partitions: Vec<PartitionId>,
    ) -> Result<Self, ValidationError> {
        if partitions.is_empty() {
            return Err(ValidationError::EmptyPartitionSet);
        }

        let mut seen = BTreeSet::new();
        for partition in &partitions {
            if !seen.insert(partition) {
                return Err(ValidationError::DuplicatePartition {
                    partition: partition.to_string(),
                });
            }
        }

        Ok(Self {
            id,
            name: name.into(),
            partitions,
        })
    }

    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    pub fn has_partition(&self, partition: &PartitionId) -> bool {
        self.partitions.contains(partition)
    }
}

#[derive(Deserialize)]
struct RawEntity {
    id: EntityId,
    #[serde(default)]
    name: Option<String>,
    partitions: Vec<PartitionId>,
}

impl TryFrom<RawEntity> for Entity {
    type Error = ValidationError;

    fn try_from(raw: RawEntity) -> Result<Self, Self::Error> {
        let name = raw.name.unwrap_or_else(|| raw.id.to_string());
        Self::new(raw.id, name, raw.partitions)
    }
}
