//! Schema versioning for the recorder database.
//!
//! The base tables come from [`SCHEMA_STATEMENTS`]. Everything added after the
//! first release lives in [`MIGRATIONS`] and is applied in order, each step in
//! its own transaction, with the reached version written to `metadata`.

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::{Error, Result};

use super::schema::SCHEMA_STATEMENTS;

/// The schema version this build writes.
pub const CURRENT_VERSION: i32 = 2;

const VERSION_KEY: &str = "schema_version";

/// Steps taking the schema from `version - 1` to `version`.
const MIGRATIONS: &[(i32, &str)] = &[
    // Base tables only.
    (1, ""),
    // Entries are always read per recording in time order.
    (
        2,
        "CREATE INDEX IF NOT EXISTS idx_entries_recording_time
             ON recording_entries(recording_id, timestamp, id)",
    ),
];

/// Create the base tables and bring the schema up to [`CURRENT_VERSION`].
///
/// # Errors
///
/// Returns [`Error::DatabaseMigration`] if the database was written by a newer
/// build or holds an unreadable version, or a database error if a step fails.
pub fn initialize_schema(conn: &mut Connection) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        conn.execute(statement, [])?;
    }

    let version = schema_version(conn)?;
    if version > CURRENT_VERSION {
        return Err(Error::DatabaseMigration {
            message: format!(
                "database schema version {version} is newer than supported version {CURRENT_VERSION}"
            ),
        });
    }

    for &(target, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > version) {
        let tx = conn.transaction()?;
        if !sql.is_empty() {
            tx.execute_batch(sql)?;
        }
        set_schema_version(&tx, target)?;
        tx.commit()?;
        if version > 0 {
            info!("Migrated recorder database to schema version {}", target);
        }
    }

    Ok(())
}

/// Version recorded in `metadata`, or 0 for a fresh database.
fn schema_version(conn: &Connection) -> Result<i32> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match value {
        None => Ok(0),
        Some(v) => v.parse().map_err(|_| Error::DatabaseMigration {
            message: format!("invalid schema version: {v}"),
        }),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        (VERSION_KEY, version.to_string()),
    )?;
    Ok(())
}
