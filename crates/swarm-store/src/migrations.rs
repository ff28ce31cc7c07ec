//! Schema migrations.
//!
//! Versioned via `PRAGMA user_version`; each migration runs inside a
//! transaction and bumps the version.

use rusqlite::Connection;
use tracing::debug;

use crate::errors::Result;

const MIGRATIONS: [&str; 1] = [
    // v1: the three logical tables
    "CREATE TABLE IF NOT EXISTS workers (
         name   TEXT PRIMARY KEY,
         config TEXT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS process_ids (
         name TEXT PRIMARY KEY,
         pid  INTEGER NOT NULL
     );
     CREATE TABLE IF NOT EXISTS user_profiles (
         name        TEXT PRIMARY KEY,
         description TEXT NOT NULL DEFAULT '',
         entries     TEXT NOT NULL
     );",
];

/// Apply any outstanding migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let version: usize = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (idx, sql) in MIGRATIONS.iter().enumerate().skip(version) {
        let target = idx + 1;
        debug!(target, "applying migration");
        conn.execute_batch(&format!(
            "BEGIN;
             {sql}
             PRAGMA user_version = {target};
             COMMIT;"
        ))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{new_in_memory, ConnectionConfig};

    #[test]
    fn migrations_create_tables() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["workers", "process_ids", "user_profiles"] {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let version: usize = conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(version, MIGRATIONS.len());
    }
}
