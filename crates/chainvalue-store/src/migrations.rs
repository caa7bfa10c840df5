use ::duckdb::{Connection, ToSql};

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_snapshot_tables",
        sql: r#"
CREATE TABLE IF NOT EXISTS snapshots (
    entity_id TEXT NOT NULL,
    bucket_start BIGINT NOT NULL,
    snapshot_ts BIGINT NOT NULL,
    computed_at TEXT NOT NULL,
    run_id TEXT NOT NULL,
    total_usd DOUBLE NOT NULL,
    payload TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY(entity_id, bucket_start)
);

CREATE TABLE IF NOT EXISTS partition_values (
    entity_id TEXT NOT NULL,
    bucket_start BIGINT NOT NULL,
    partition_id TEXT NOT NULL,
    usd_value DOUBLE,
    provenance TEXT NOT NULL,
    observed_at TEXT
);

CREATE TABLE IF NOT EXISTS failure_log (
    run_id TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    snapshot_ts BIGINT NOT NULL,
    recorded_at TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL
);
"#,
    },
    Migration {
        version: "0002_indexes",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_partition_values_entity ON partition_values(entity_id, partition_id);
CREATE INDEX IF NOT EXISTS idx_failure_log_entity_ts ON failure_log(entity_id, snapshot_ts);
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let params: [&dyn ToSql; 1] = [&migration.version];
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            params.as_slice(),
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                params.as_slice(),
            )?;
        }
    }

    Ok(())
}

/// Versions applied so far, oldest first.
pub fn applied_versions(connection: &Connection) -> Result<Vec<String>, ::duckdb::Error> {
    let mut statement =
        connection.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let versions = statement
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(versions)
}
