use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::schedule::Interval;
use crate::types::ScheduleRecord;

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

/// SQLite-backed schedule persistence.
///
/// Not-found lookups return `Ok(None)` / an empty list, never an error.
pub struct ScheduleStore {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ── Row mapper ────────────────────────────────────────────────────────────

fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleRecord> {
    let interval_str: String = row.get(2)?;
    let last_str: String = row.get(3)?;
    let interval: Interval = interval_str.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ScheduleRecord {
        owner: row.get(0)?,
        repo: row.get(1)?,
        interval,
        last_dispatched_at: parse_ts(&last_str),
    })
}

// ── ScheduleStore impl ────────────────────────────────────────────────────

impl ScheduleStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    pub fn get_schedule(&self, owner: &str, repo: &str) -> Result<Option<ScheduleRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let record = conn
            .query_row(
                "SELECT owner, repo, interval, last_dispatched_at \
                 FROM schedules WHERE owner = ?1 AND repo = ?2",
                params![owner, repo],
                row_to_schedule,
            )
            .optional()?;
        Ok(record)
    }

    /// Create the record for a first-seen repository. A record that already
    /// exists is left untouched — records are created once and thereafter
    /// only refreshed.
    pub fn store_schedule(&self, record: &ScheduleRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO schedules (owner, repo, interval, last_dispatched_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(owner, repo) DO NOTHING",
            params![
                record.owner,
                record.repo,
                record.interval.as_str(),
                format_ts(record.last_dispatched_at),
            ],
        )?;
        Ok(())
    }

    /// Refresh only the last-dispatch timestamp of an existing record.
    pub fn update_last_dispatched(&self, record: &ScheduleRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE schedules SET last_dispatched_at = ?1, updated_at = ?2 \
             WHERE owner = ?3 AND repo = ?4",
            params![
                format_ts(record.last_dispatched_at),
                format_ts(Utc::now()),
                record.owner,
                record.repo,
            ],
        )?;
        Ok(())
    }

    pub fn remove_schedule(&self, owner: &str, repo: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "DELETE FROM schedules WHERE owner = ?1 AND repo = ?2",
            params![owner, repo],
        )?;
        Ok(())
    }

    pub fn list_schedules_for_owner(&self, owner: &str) -> Result<Vec<ScheduleRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT owner, repo, interval, last_dispatched_at \
             FROM schedules WHERE owner = ?1 ORDER BY repo ASC",
        )?;
        let records = stmt
            .query_map(params![owner], row_to_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
