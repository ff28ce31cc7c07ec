//! # swarm-store
//!
//! Persistence gateway for declared worker state. Three logical
//! tables: `workers` (declared configs), `process_ids` (last-known
//! child PIDs for orphan cleanup), and `user_profiles` (user-defined
//! bundles). Backed by `SQLite` in WAL mode.
//!
//! Derived instances (internal names containing `#` or `@`) are never
//! written back: the gateway rejects such saves so scaled and
//! session-owned clones cannot shadow their primaries.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod migrations;

pub use connection::{new_file, new_in_memory, ConnectionConfig, ConnectionPool};
pub use errors::{Result, StoreError};

use rusqlite::OptionalExtension;
use tracing::warn;

use swarm_core::profile::ProfileBundle;
use swarm_core::worker::{InternalName, WorkerConfig};

/// Facade over the three tables.
pub struct Store {
    pool: ConnectionPool,
}

impl Store {
    /// Open a file-backed store and apply migrations.
    pub fn open(path: &std::path::Path, config: &ConnectionConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let pool = new_file(path, config)?;
        let conn = pool.get()?;
        migrations::run_migrations(&conn)?;
        Ok(Self { pool })
    }

    /// Open an in-memory store (tests and stdio scratch mode).
    pub fn open_in_memory() -> Result<Self> {
        let pool = new_in_memory(&ConnectionConfig {
            // A single shared connection: `:memory:` databases are
            // per-connection, so the pool must not open a second one.
            pool_size: 1,
            ..ConnectionConfig::default()
        })?;
        let conn = pool.get()?;
        migrations::run_migrations(&conn)?;
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<connection::PooledConnection> {
        Ok(self.pool.get()?)
    }

    // ── workers ────────────────────────────────────────────────────────

    /// Persist a worker config keyed by its name.
    ///
    /// Saves of derived instances (`#`/`@` in the name) are silently
    /// skipped; they never shadow primaries in the store.
    pub fn save_worker(&self, config: &WorkerConfig) -> Result<()> {
        if InternalName::is_derived(&config.name) {
            warn!(name = %config.name, "refusing to persist derived instance config");
            return Ok(());
        }
        let json = serde_json::to_string(config).map_err(|e| StoreError::Corrupt {
            table: "workers",
            message: e.to_string(),
        })?;
        let _ = self.conn()?.execute(
            "INSERT INTO workers (name, config) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET config = excluded.config",
            rusqlite::params![config.name, json],
        )?;
        Ok(())
    }

    /// Fetch one worker config.
    pub fn get_worker(&self, name: &str) -> Result<Option<WorkerConfig>> {
        let json: Option<String> = self
            .conn()?
            .query_row(
                "SELECT config FROM workers WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| {
            serde_json::from_str(&j).map_err(|e| StoreError::Corrupt {
                table: "workers",
                message: e.to_string(),
            })
        })
        .transpose()
    }

    /// All persisted worker configs, sorted by name.
    pub fn list_workers(&self) -> Result<Vec<WorkerConfig>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name, config FROM workers ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let json: String = row.get(1)?;
            Ok((name, json))
        })?;

        let mut configs = Vec::new();
        for row in rows {
            let (name, json) = row?;
            match serde_json::from_str(&json) {
                Ok(config) => configs.push(config),
                // One corrupt row must not hide every other worker.
                Err(e) => warn!(name, error = %e, "skipping corrupt worker row"),
            }
        }
        Ok(configs)
    }

    /// Remove a worker config. Returns whether a row existed.
    pub fn delete_worker(&self, name: &str) -> Result<bool> {
        let n = self
            .conn()?
            .execute("DELETE FROM workers WHERE name = ?1", [name])?;
        Ok(n > 0)
    }

    // ── process_ids ────────────────────────────────────────────────────

    /// Record the live PID for a worker.
    pub fn save_pid(&self, name: &str, pid: u32) -> Result<()> {
        let _ = self.conn()?.execute(
            "INSERT INTO process_ids (name, pid) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET pid = excluded.pid",
            rusqlite::params![name, pid],
        )?;
        Ok(())
    }

    /// Forget the PID for a worker.
    pub fn delete_pid(&self, name: &str) -> Result<()> {
        let _ = self
            .conn()?
            .execute("DELETE FROM process_ids WHERE name = ?1", [name])?;
        Ok(())
    }

    /// All recorded `(name, pid)` pairs. Invalid (non-positive) PIDs
    /// are skipped.
    pub fn list_pids(&self) -> Result<Vec<(String, u32)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name, pid FROM process_ids")?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let pid: i64 = row.get(1)?;
            Ok((name, pid))
        })?;

        let mut pids = Vec::new();
        for row in rows {
            let (name, pid) = row?;
            match u32::try_from(pid) {
                Ok(pid) if pid > 0 => pids.push((name, pid)),
                _ => warn!(name, pid, "skipping invalid pid entry"),
            }
        }
        Ok(pids)
    }

    /// Drop every recorded PID.
    pub fn clear_pids(&self) -> Result<()> {
        let _ = self.conn()?.execute("DELETE FROM process_ids", [])?;
        Ok(())
    }

    // ── user_profiles ──────────────────────────────────────────────────

    /// Persist a user bundle keyed by its name.
    pub fn save_profile(&self, bundle: &ProfileBundle) -> Result<()> {
        let entries = serde_json::to_string(&bundle.entries).map_err(|e| StoreError::Corrupt {
            table: "user_profiles",
            message: e.to_string(),
        })?;
        let _ = self.conn()?.execute(
            "INSERT INTO user_profiles (name, description, entries) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET
                 description = excluded.description,
                 entries = excluded.entries",
            rusqlite::params![bundle.name, bundle.description, entries],
        )?;
        Ok(())
    }

    /// Fetch one user bundle.
    pub fn get_profile(&self, name: &str) -> Result<Option<ProfileBundle>> {
        let row: Option<(String, String)> = self
            .conn()?
            .query_row(
                "SELECT description, entries FROM user_profiles WHERE name = ?1",
                [name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(description, entries)| {
            let entries = serde_json::from_str(&entries).map_err(|e| StoreError::Corrupt {
                table: "user_profiles",
                message: e.to_string(),
            })?;
            Ok(ProfileBundle {
                name: name.to_owned(),
                description,
                entries,
                builtin: false,
            })
        })
        .transpose()
    }

    /// All user bundles, sorted by name.
    pub fn list_profiles(&self) -> Result<Vec<ProfileBundle>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT name, description, entries FROM user_profiles ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let description: String = row.get(1)?;
            let entries: String = row.get(2)?;
            Ok((name, description, entries))
        })?;

        let mut bundles = Vec::new();
        for row in rows {
            let (name, description, entries) = row?;
            match serde_json::from_str(&entries) {
                Ok(entries) => bundles.push(ProfileBundle {
                    name,
                    description,
                    entries,
                    builtin: false,
                }),
                Err(e) => warn!(name, error = %e, "skipping corrupt profile row"),
            }
        }
        Ok(bundles)
    }

    /// Delete a user bundle. Returns whether a row existed.
    pub fn delete_profile(&self, name: &str) -> Result<bool> {
        let n = self
            .conn()?
            .execute("DELETE FROM user_profiles WHERE name = ?1", [name])?;
        Ok(n > 0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
