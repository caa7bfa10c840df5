use std::path::Path;

use chainvalue_core::{EntityId, PartitionId};
use serde_json::json;

use crate::cli::{FailuresArgs, HistoryArgs};
use crate::error::CliError;

use super::{open_store, CommandOutput};

pub fn snapshots(args: &HistoryArgs, db: Option<&Path>) -> Result<CommandOutput, CliError> {
    let entity = EntityId::parse(&args.entity)?;
    let store = open_store(db)?;

    let data = match &args.partition {
        Some(partition) => {
            let partition = PartitionId::parse(partition)?;
            let series = store.partition_series(&entity, &partition)?;
            json!({
                "entity": entity,
                "partition": partition,
                "values": series,
            })
        }
        None => {
            let snapshots = store.list_snapshots(&entity)?;
            json!({
                "entity": entity,
                "count": snapshots.len(),
                "snapshots": snapshots,
            })
        }
    };
    Ok(CommandOutput::ok(data))
}

pub fn failures(args: &FailuresArgs, db: Option<&Path>) -> Result<CommandOutput, CliError> {
    let entity = EntityId::parse(&args.entity)?;
    let store = open_store(db)?;
    let failures = store.list_failures(&entity)?;

    Ok(CommandOutput::ok(json!({
        "entity": entity,
        "count": failures.len(),
        "failures": failures,
    })))
}
