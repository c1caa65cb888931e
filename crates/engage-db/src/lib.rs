//! # Engage DB
//!
//! SQLite store behind the automation engine and the campaign pipeline.
//!
//! One connection guarded by a `std::sync::Mutex`; the lock is held for a
//! single statement (or one short transaction), never across an `.await`.
//! Status changes that race with other writers are expressed as conditional
//! `UPDATE ... WHERE status IN (...)` statements instead of read-modify-write.
//!
//! ```text
//! automations ──< executions
//! campaigns   ──< campaign_recipients
//! list_members        (target lists)
//! jobs                (delayed job queue)
//! ```

mod automations;
mod campaigns;
mod jobs;
mod lists;
mod recipients;

pub use jobs::JobState;

use chrono::{DateTime, SecondsFormat, Utc};
use engage_core::error::{EngageError, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Engage database handle.
pub struct EngageDb {
    conn: Mutex<Connection>,
}

impl EngageDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| EngageError::Database(format!("DB open error: {e}")))?;

        // WAL keeps readers unblocked while the worker writes.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        tracing::debug!("🗄️ Engage DB opened at {}", path.display());
        Ok(db)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngageError::Database(format!("DB open error: {e}")))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS automations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                nodes_json TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                execution_count INTEGER NOT NULL DEFAULT 0,
                last_executed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                automation_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                trigger_payload TEXT NOT NULL,
                action_results TEXT NOT NULL DEFAULT '[]',
                error_message TEXT,
                executed_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_executions_automation
                ON executions(automation_id, executed_at);

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                list_id TEXT NOT NULL,
                channels_json TEXT NOT NULL DEFAULT '[]',
                template_id TEXT NOT NULL DEFAULT '',
                template_variables_json TEXT NOT NULL DEFAULT '{}',
                locale TEXT NOT NULL DEFAULT 'en',
                sms_body TEXT,
                email_subject TEXT,
                email_body TEXT,
                status TEXT NOT NULL DEFAULT 'draft',
                scheduled_at TEXT,
                sent_at TEXT,
                cancelled_at TEXT,
                follow_ups_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS campaign_recipients (
                campaign_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                address TEXT,
                fields_json TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending',
                sent_at TEXT,
                delivered_at TEXT,
                read_at TEXT,
                opened_at TEXT,
                clicked_at TEXT,
                replied_at TEXT,
                failed_at TEXT,
                failure_reason TEXT,
                external_message_id TEXT,
                PRIMARY KEY (campaign_id, recipient_id)
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_message
                ON campaign_recipients(external_message_id);

            CREATE TABLE IF NOT EXISTS list_members (
                list_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                address TEXT,
                fields_json TEXT NOT NULL DEFAULT '{}',
                added_at TEXT NOT NULL,
                PRIMARY KEY (list_id, recipient_id)
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                topic TEXT NOT NULL,
                payload TEXT NOT NULL,
                ready_at INTEGER NOT NULL,       -- epoch millis
                attempts INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'queued',  -- queued, running, done, dead
                job_key TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs(topic, state, ready_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_key ON jobs(job_key);
            ",
        )
        .map_err(|e| EngageError::Database(format!("Migration error: {e}")))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EngageError::Database(format!("Lock: {e}")))
    }
}

/// `map_err` adapter: tag a rusqlite error with what was being done.
pub(crate) fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> EngageError {
    move |e| EngageError::Database(format!("{context}: {e}"))
}

/// Fixed-width UTC timestamps so that text comparison matches time order.
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion(idx, e))
}

pub(crate) fn conversion(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}
