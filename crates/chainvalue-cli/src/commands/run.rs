//! Value one entity from a fixture and persist the outcome.

use std::path::Path;
use std::sync::Arc;

use chainvalue_core::{
    EngineBuilder, EngineConfig, MemoryStore, PriceSource, ReferenceSource, RunStatus,
    SnapshotStore,
};
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::error::CliError;
use crate::fixture::Fixture;

use super::{open_store, CommandOutput};

pub async fn run(args: &RunArgs, db: Option<&Path>) -> Result<CommandOutput, CliError> {
    if args.in_memory && db.is_some() {
        return Err(CliError::Usage(String::from(
            "--in-memory cannot be combined with --db",
        )));
    }

    let fixture = Fixture::load(&args.fixture)?;
    let config = engine_config(args)?;
    let store: Arc<dyn SnapshotStore> = if args.in_memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(open_store(db)?)
    };

    let prices: Arc<dyn PriceSource> = Arc::new(fixture.prices());
    let mut builder = EngineBuilder::new(fixture.registry(), prices, store).with_config(config);
    if let Some((oracle, currencies)) = fixture.reference() {
        let oracle: Arc<dyn ReferenceSource> = Arc::new(oracle);
        builder = builder.with_reference_source(oracle, currencies);
    }
    let engine = Arc::new(builder.build()?);

    let handle = engine.spawn(fixture.entity.clone(), fixture.at());
    let cancel = handle.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            cancel.cancel();
        }
    });
    let report = handle.wait().await;
    interrupt.abort();
    let report = report?;

    info!(
        run_id = %report.run_id,
        status = ?report.status,
        total_usd = report.total_usd,
        "run finished"
    );

    let exit_code = match report.status {
        RunStatus::Succeeded => 0,
        RunStatus::Failed => 3,
        RunStatus::Cancelled => 130,
    };
    Ok(CommandOutput {
        data: serde_json::to_value(&report)?,
        exit_code,
    })
}

fn engine_config(args: &RunArgs) -> Result<EngineConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => EngineConfig::default(),
    };

    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(limit) = args.staleness_limit_seconds {
        config.staleness_limit_seconds = limit;
    }
    if let Some(limit) = args.materiality_limit {
        config.materiality_limit = limit;
    }
    if let Some(timeout) = args.timeout_per_attempt_ms {
        config.timeout_per_attempt_ms = timeout;
    }
    if args.tolerate_omissions {
        config.tolerate_omissions = true;
    }

    config.validate()?;
    Ok(config)
}
