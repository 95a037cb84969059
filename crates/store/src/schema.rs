//! Schema & migrations (spec §4.2.1). Safe to run on every host at startup,
//! concurrently: column adds are idempotent, and duplicate-column errors
//! from racing hosts are treated as success rather than propagated.

use crate::client::StoreClient;
use crate::error::Result;
use log::debug;

struct ExpectedColumn {
    table: &'static str,
    column: &'static str,
    ddl: &'static str,
}

const EXPECTED_COLUMNS: &[ExpectedColumn] = &[
    ExpectedColumn {
        table: "container",
        column: "health_status",
        ddl: "ALTER TABLE container ADD COLUMN health_status TEXT NOT NULL DEFAULT 'unknown'",
    },
    ExpectedColumn {
        table: "container",
        column: "last_health_check",
        ddl: "ALTER TABLE container ADD COLUMN last_health_check INTEGER NOT NULL DEFAULT 0",
    },
    ExpectedColumn {
        table: "container",
        column: "consecutive_failures",
        ddl: "ALTER TABLE container ADD COLUMN consecutive_failures INTEGER NOT NULL DEFAULT 0",
    },
    ExpectedColumn {
        table: "container",
        column: "health_port",
        ddl: "ALTER TABLE container ADD COLUMN health_port INTEGER",
    },
];

const INDEX_STATEMENTS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_container_server_id ON container(server_id)",
    "CREATE INDEX IF NOT EXISTS idx_container_service ON container(service)",
    "CREATE INDEX IF NOT EXISTS idx_container_health_status ON container(health_status)",
    "CREATE INDEX IF NOT EXISTS idx_server_last_seen ON server(last_seen)",
];

const BACKFILL_STATEMENT: &str =
    "UPDATE container SET health_status = 'unknown' WHERE health_status IS NULL";

#[derive(Debug, Default)]
pub struct MigrationReport {
    pub columns_added: Vec<String>,
    pub indexes_written: bool,
    pub backfilled: bool,
}

fn is_duplicate_column_error(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("duplicate column") || m.contains("already exists")
}

async fn column_exists(store: &StoreClient, table: &str, column: &str) -> Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = '{column}'"
    );
    let rows = store.query(&sql).await?;
    Ok(rows
        .first()
        .and_then(|r| r.first())
        .and_then(|c| c.parse::<u64>().ok())
        .unwrap_or(0)
        > 0)
}

/// Ensures every expected column exists, then writes the four indexes and
/// backfills `health_status` on pre-existing rows. Running this on a
/// schema that already has everything produces no writes (testable
/// property 8).
pub async fn ensure_schema(store: &StoreClient) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();

    for expected in EXPECTED_COLUMNS {
        if column_exists(store, expected.table, expected.column).await? {
            continue;
        }
        match store.exec(&[expected.ddl.to_owned()]).await {
            Ok(_) => {
                report.columns_added.push(expected.column.to_owned());
            }
            Err(e) if is_duplicate_column_error(&e.to_string()) => {
                debug!(
                    "concurrent migration already added {}.{}",
                    expected.table, expected.column
                );
            }
            Err(e) => return Err(e),
        }
    }

    if !report.columns_added.is_empty() {
        let stmts: Vec<String> = INDEX_STATEMENTS.iter().map(|s| s.to_string()).collect();
        store.exec(&stmts).await?;
        report.indexes_written = true;

        store.exec(&[BACKFILL_STATEMENT.to_owned()]).await?;
        report.backfilled = true;
    }

    Ok(report)
}
