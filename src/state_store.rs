// src/state_store.rs
//
// §2.1 / component O: persistence. Not authoritative scheduler state — a
// restart rebuilds the Back-off Cache and Busy Set empty, by design — but a
// crash-visible record of recent back-off installs and busy claims/releases
// for operators debugging why a queue went quiet. Grounded on the teacher's
// `CheckpointStore`: same hybrid relational/JSON-blob pattern, same HPC
// journaling pragmas, opened fresh per call rather than held open.

use crate::model::Fingerprint;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

pub struct StateStore {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffEventRow {
    pub project: String,
    pub queue: String,
    pub ttl_ms: i64,
    pub recorded_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyEventRow {
    pub project: String,
    pub queue: String,
    pub action: String,
    pub recorded_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub busy_count: i64,
    pub backoff_count: i64,
    pub recorded_at_ms: i64,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self { path: path.as_ref().to_path_buf() };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;

        // DELETE journal mode avoids WAL files on shared filesystems; these
        // rows are debug-only so synchronous=NORMAL's durability window is
        // acceptable.
        conn.execute_batch(
            "PRAGMA journal_mode=DELETE;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;",
        )?;

        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS backoff_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL,
                queue TEXT NOT NULL,
                ttl_ms INTEGER NOT NULL,
                recorded_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS busy_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL,
                queue TEXT NOT NULL,
                action TEXT NOT NULL,
                recorded_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                busy_count INTEGER NOT NULL,
                backoff_count INTEGER NOT NULL,
                recorded_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_backoff_recorded ON backoff_events(recorded_at_ms);
            CREATE INDEX IF NOT EXISTS idx_busy_recorded ON busy_events(recorded_at_ms);
            CREATE INDEX IF NOT EXISTS idx_snapshot_recorded ON snapshots(recorded_at_ms);
            COMMIT;",
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.path).context("failed to open state store database")
    }

    pub fn record_backoff(&self, key: &Fingerprint, ttl_ms: i64, recorded_at_ms: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO backoff_events (project, queue, ttl_ms, recorded_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![key.project, key.queue, ttl_ms, recorded_at_ms],
        )?;
        Ok(())
    }

    pub fn record_busy(&self, key: &Fingerprint, action: &str, recorded_at_ms: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO busy_events (project, queue, action, recorded_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![key.project, key.queue, action, recorded_at_ms],
        )?;
        Ok(())
    }

    /// Most recent back-off installs, newest first, for an operator tailing
    /// why a queue has gone quiet.
    pub fn recent_backoff_events(&self, limit: u32) -> Result<Vec<BackoffEventRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT project, queue, ttl_ms, recorded_at_ms FROM backoff_events
             ORDER BY recorded_at_ms DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(BackoffEventRow {
                project: row.get(0)?,
                queue: row.get(1)?,
                ttl_ms: row.get(2)?,
                recorded_at_ms: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to read back-off events")
    }

    pub fn recent_busy_events(&self, limit: u32) -> Result<Vec<BusyEventRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT project, queue, action, recorded_at_ms FROM busy_events
             ORDER BY recorded_at_ms DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(BusyEventRow {
                project: row.get(0)?,
                queue: row.get(1)?,
                action: row.get(2)?,
                recorded_at_ms: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to read busy events")
    }

    /// Periodic aggregate sample of the Back-off Cache / Busy Set sizes —
    /// cheaper than one row per claim/release for a process that may churn
    /// through thousands of probes an hour, while still giving an operator
    /// a timeline to correlate against `recent_*_events`.
    pub fn record_snapshot(&self, busy_count: i64, backoff_count: i64, recorded_at_ms: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO snapshots (busy_count, backoff_count, recorded_at_ms) VALUES (?1, ?2, ?3)",
            params![busy_count, backoff_count, recorded_at_ms],
        )?;
        Ok(())
    }

    pub fn recent_snapshots(&self, limit: u32) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT busy_count, backoff_count, recorded_at_ms FROM snapshots
             ORDER BY recorded_at_ms DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(SnapshotRow { busy_count: row.get(0)?, backoff_count: row.get(1)?, recorded_at_ms: row.get(2)? })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to read snapshot rows")
    }

    /// Drops rows older than `older_than_ms` (an absolute epoch-ms cutoff),
    /// keeping this debug log bounded across a long-running process.
    pub fn prune_before(&self, older_than_ms: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM backoff_events WHERE recorded_at_ms < ?1", params![older_than_ms])?;
        conn.execute("DELETE FROM busy_events WHERE recorded_at_ms < ?1", params![older_than_ms])?;
        conn.execute("DELETE FROM snapshots WHERE recorded_at_ms < ?1", params![older_than_ms])?;
        Ok(())
    }
}
