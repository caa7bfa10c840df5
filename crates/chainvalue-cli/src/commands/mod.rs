mod history;
mod run;

use std::path::Path;

use chainvalue_store::{DuckDbSnapshotStore, StoreConfig};
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub struct CommandOutput {
    pub data: Value,
    /// Process exit status; `0` unless the command reports a failed outcome.
    pub exit_code: u8,
}

impl CommandOutput {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            exit_code: 0,
        }
    }
}

pub async fn run(cli: &Cli) -> Result<CommandOutput, CliError> {
    let db = cli.db.as_deref();
    match &cli.command {
        Command::Run(args) => run::run(args, db).await,
        Command::History(args) => history::snapshots(args, db),
        Command::Failures(args) => history::failures(args, db),
    }
}

pub fn render(output: &CommandOutput, pretty: bool) -> Result<(), CliError> {
    let rendered = if pretty {
        serde_json::to_string_pretty(&output.data)?
    } else {
        serde_json::to_string(&output.data)?
    };
    println!("{rendered}");
    Ok(())
}

fn open_store(db: Option<&Path>) -> Result<DuckDbSnapshotStore, CliError> {
    let store = match db {
        Some(path) => {
            let mut config = StoreConfig::default();
            if let Some(parent) = path.parent() {
                config.chainvalue_home = parent.to_path_buf();
            }
            config.db_path = path.to_path_buf();
            DuckDbSnapshotStore::open(config)?
        }
        None => DuckDbSnapshotStore::open_default()?,
    };
    Ok(store)
}
