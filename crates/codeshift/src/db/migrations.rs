//! Schema migrations, recorded in the `_migrations` ledger.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_jobs_tables",
        sql: include_str!("sql/001_create_jobs.sql"),
    },
    Migration {
        version: 2,
        description: "create_stage_attempts_table",
        sql: include_str!("sql/002_create_stage_attempts.sql"),
    },
    Migration {
        version: 3,
        description: "create_job_logs_table",
        sql: include_str!("sql/003_create_job_logs.sql"),
    },
];

const LEDGER: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// Version of the newest known migration.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Highest version recorded in the ledger, 0 for a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32, DatabaseError> {
    conn.execute_batch(LEDGER)?;
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?)
}

/// Applies every migration newer than the recorded version, each in its own
/// transaction together with its ledger row. Returns how many were applied.
pub fn run_all(conn: &Connection) -> Result<usize, DatabaseError> {
    let current = current_version(conn)?;
    if current > latest_version() {
        return Err(DatabaseError::Migration {
            version: current,
            reason: format!(
                "database schema is newer than this build (v{} > v{})",
                current,
                latest_version()
            ),
        });
    }

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(conn, migration)?;
        applied += 1;
    }
    Ok(applied)
}

fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let failed = |e: rusqlite::Error| DatabaseError::Migration {
        version: migration.version,
        reason: e.to_string(),
    };

    log::info!(
        "Applying migration v{}: {}",
        migration.version,
        migration.description
    );
    let tx = conn.unchecked_transaction().map_err(failed)?;
    tx.execute_batch(migration.sql).map_err(failed)?;
    tx.execute(
        "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
        rusqlite::params![migration.version, migration.description],
    )
    .map_err(failed)?;
    tx.commit().map_err(failed)
}
