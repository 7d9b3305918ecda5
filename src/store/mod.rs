//! Durable tables shared by the scheduler, the dispatch loop and outside
//! tooling: `periodic`, `schedule` and `instances`.
//!
//! Every operation opens its own connection and, when it writes, its own
//! transaction. Nothing is held across an `.await`.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Periodic entries whose names start with this marker are dropped at startup.
pub const TRANSIENT_MARKER: char = '@';

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicEntry {
    pub name: String,
    /// Seconds between runs
    pub period: u64,
    /// Unix time of the last emission
    pub last_run: i64,
    pub command: String,
    pub args: Vec<Value>,
}

impl PeriodicEntry {
    /// First instant at which the entry is due again: `last_run` rounded down
    /// to a period boundary, plus one period. `None` for a zero period.
    pub fn next_due(&self) -> Option<i64> {
        let period = i64::try_from(self.period).ok().filter(|p| *p > 0)?;
        Some(self.last_run.div_euclid(period) * period + period)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub unixtime: i64,
    pub command: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the three tables if missing.
    pub fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS periodic (
                    name     TEXT PRIMARY KEY,
                    period   INTEGER NOT NULL,
                    last_run INTEGER NOT NULL,
                    command  TEXT NOT NULL,
                    args     TEXT NOT NULL DEFAULT '[]'
                );
                CREATE TABLE IF NOT EXISTS schedule (
                    id       INTEGER PRIMARY KEY AUTOINCREMENT,
                    unixtime INTEGER NOT NULL,
                    command  TEXT NOT NULL,
                    args     TEXT NOT NULL DEFAULT '[]'
                );
                CREATE INDEX IF NOT EXISTS idx_schedule_unixtime ON schedule(unixtime);
                CREATE TABLE IF NOT EXISTS instances (
                    pid INTEGER NOT NULL
                );",
            )
            .context("Failed to initialize database schema")
        })
    }

    // ── periodic ─────────────────────────────────────────────────

    /// Insert or replace a periodic entry by name.
    pub fn replace_periodic(&self, entry: &PeriodicEntry) -> Result<()> {
        let args = encode_args(&entry.args)?;
        let period = i64::try_from(entry.period).context("Period out of range")?;
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO periodic (name, period, last_run, command, args)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![entry.name, period, entry.last_run, entry.command, args],
            )
            .context("Failed to write periodic entry")?;
            Ok(())
        })
    }

    pub fn periodic_entries(&self) -> Result<Vec<PeriodicEntry>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, period, last_run, command, args FROM periodic ORDER BY name ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (name, period, last_run, command, args) = row?;
                let args = match decode_args(&args) {
                    Ok(args) => args,
                    Err(e) => {
                        tracing::warn!("Skipping periodic entry `{name}`: {e}");
                        continue;
                    }
                };
                entries.push(PeriodicEntry {
                    name,
                    period: u64::try_from(period).unwrap_or(0),
                    last_run,
                    command,
                    args,
                });
            }
            Ok(entries)
        })
    }

    /// Advance `last_run` for one entry. Never moves it backwards.
    pub fn touch_periodic(&self, name: &str, last_run: i64) -> Result<()> {
        self.with_transaction(|tx| {
            tx.execute(
                "UPDATE periodic SET last_run = MAX(last_run, ?2) WHERE name = ?1",
                params![name, last_run],
            )
            .context("Failed to update periodic entry")?;
            Ok(())
        })
    }

    /// Drop every transient (`@`-prefixed) periodic entry. Returns how many went.
    pub fn purge_transient_periodic(&self) -> Result<usize> {
        self.with_transaction(|tx| {
            let removed = tx
                .execute(
                    "DELETE FROM periodic WHERE substr(name, 1, 1) = ?1",
                    params![TRANSIENT_MARKER.to_string()],
                )
                .context("Failed to purge transient periodic entries")?;
            Ok(removed)
        })
    }

    // ── schedule ─────────────────────────────────────────────────

    pub fn insert_schedule(&self, entry: &ScheduleEntry) -> Result<i64> {
        let args = encode_args(&entry.args)?;
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO schedule (unixtime, command, args) VALUES (?1, ?2, ?3)",
                params![entry.unixtime, entry.command, args],
            )
            .context("Failed to write schedule entry")?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Entries due at or before `now`, oldest first, with their row ids.
    /// Due rows whose arguments no longer decode are deleted.
    pub fn due_schedule(&self, now: i64) -> Result<Vec<(i64, ScheduleEntry)>> {
        self.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, unixtime, command, args FROM schedule
                 WHERE unixtime <= ?1 ORDER BY unixtime ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut due = Vec::new();
            let mut corrupt = Vec::new();
            for row in rows {
                let (id, unixtime, command, args) = row?;
                match decode_args(&args) {
                    Ok(args) => due.push((
                        id,
                        ScheduleEntry {
                            unixtime,
                            command,
                            args,
                        },
                    )),
                    Err(e) => {
                        tracing::warn!("Dropping schedule entry {id} (`{command}`): {e}");
                        corrupt.push(id);
                    }
                }
            }
            drop(stmt);
            for id in corrupt {
                tx.execute("DELETE FROM schedule WHERE id = ?1", params![id])
                    .context("Failed to delete schedule entry")?;
            }
            Ok(due)
        })
    }

    pub fn delete_schedule(&self, id: i64) -> Result<()> {
        self.with_transaction(|tx| {
            tx.execute("DELETE FROM schedule WHERE id = ?1", params![id])
                .context("Failed to delete schedule entry")?;
            Ok(())
        })
    }

    pub fn schedule_len(&self) -> Result<usize> {
        self.with_connection(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM schedule", [], |r| r.get(0))?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }

    // ── instances ────────────────────────────────────────────────

    /// Drop rows for processes that no longer exist, then add `pid`.
    pub fn register_instance(&self, pid: u32) -> Result<()> {
        self.with_transaction(|tx| {
            let pids = {
                let mut stmt = tx.prepare("SELECT pid FROM instances")?;
                let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
                rows.collect::<rusqlite::Result<Vec<i64>>>()?
            };
            for stale in pids.into_iter().filter(|p| !pid_alive(*p)) {
                tx.execute("DELETE FROM instances WHERE pid = ?1", params![stale])?;
            }
            let already: Option<i64> = tx
                .query_row(
                    "SELECT pid FROM instances WHERE pid = ?1",
                    params![i64::from(pid)],
                    |row| row.get(0),
                )
                .optional()?;
            if already.is_none() {
                tx.execute("INSERT INTO instances (pid) VALUES (?1)", params![i64::from(pid)])
                    .context("Failed to register instance")?;
            }
            Ok(())
        })
    }

    /// Registered process ids in registration order.
    pub fn instance_pids(&self) -> Result<Vec<i64>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT pid FROM instances ORDER BY rowid ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
        })
    }

    pub fn unregister_instance(&self, pid: u32) -> Result<()> {
        self.with_transaction(|tx| {
            tx.execute("DELETE FROM instances WHERE pid = ?1", params![i64::from(pid)])?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(&self.path)
            .with_context(|| format!("Failed to open database: {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        f(&conn)
    }

    /// Run `f` in a transaction that commits on `Ok` and rolls back otherwise.
    fn with_transaction<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction()?;
            let value = f(&tx)?;
            tx.commit().context("Failed to commit transaction")?;
            Ok(value)
        })
    }
}

fn encode_args(args: &[Value]) -> Result<String> {
    serde_json::to_string(args).context("Failed to encode arguments")
}

fn decode_args(raw: &str) -> Result<Vec<Value>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).with_context(|| format!("Invalid stored arguments: {raw}"))
}

/// Whether a process with this id exists.
#[cfg(unix)]
pub fn pid_alive(pid: i64) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: i64) -> bool {
    true
}
