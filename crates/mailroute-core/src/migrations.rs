use chrono::Utc;
use libsql::{Connection, params};
use thiserror::Error;
use tracing::{debug, info};

use crate::db::{Database, DbError};

/// One schema step. Versions are applied in ascending order and never reused.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "processing_records",
    sql: include_str!("../../../migrations/001_processing_records.sql"),
}];

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("migration {version} ({name}) failed: {source}")]
    Apply {
        version: i64,
        name: &'static str,
        source: libsql::Error,
    },
    #[error("could not read schema version: {0}")]
    Version(#[from] libsql::Error),
}

async fn current_version(conn: &Connection) -> Result<i64, MigrationError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        (),
    )
    .await?;

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", ())
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get(0)?),
        None => Ok(0),
    }
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), libsql::Error> {
    let tx = conn.transaction().await?;
    tx.execute_batch(migration.sql).await?;
    tx.execute(
        "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![migration.version, migration.name, Utc::now().to_rfc3339()],
    )
    .await?;
    tx.commit().await
}

async fn migrate(conn: &Connection, migrations: &[Migration]) -> Result<usize, MigrationError> {
    let from = current_version(conn).await?;
    let mut applied = 0;

    for migration in migrations.iter().filter(|m| m.version > from) {
        apply(conn, migration)
            .await
            .map_err(|source| MigrationError::Apply {
                version: migration.version,
                name: migration.name,
                source,
            })?;
        info!(version = migration.version, name = migration.name, "applied migration");
        applied += 1;
    }

    if applied == 0 {
        debug!(version = from, "schema up to date");
    }
    Ok(applied)
}

/// Bring the record schema up to date. Returns how many steps ran.
pub async fn run_migrations(db: &Database) -> Result<usize, MigrationError> {
    let conn = db.connection().await?;
    migrate(&conn, MIGRATIONS).await
}
