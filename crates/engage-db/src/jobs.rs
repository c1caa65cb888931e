//! Storage for the delayed job queue.

use chrono::{DateTime, TimeZone, Utc};
use engage_core::error::{EngageError, Result};
use engage_core::traits::Job;
use rusqlite::{OptionalExtension, Row, params};

use crate::{EngageDb, db_err, parse_json, ts};

/// Lifecycle of a stored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Dead => "dead",
        }
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let payload: String = row.get(2)?;
    let ready_ms: i64 = row.get(3)?;
    Ok(Job {
        id: row.get(0)?,
        topic: row.get(1)?,
        payload: parse_json(2, &payload)?,
        ready_at: millis_to_utc(ready_ms),
        attempts: row.get::<_, i64>(4)? as u32,
        key: row.get(5)?,
    })
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl EngageDb {
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO jobs (id, topic, payload, ready_at, attempts, state, job_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, 'queued', ?5, ?6)",
                params![
                    job.id,
                    job.topic,
                    job.payload.to_string(),
                    job.ready_at.timestamp_millis(),
                    job.key,
                    ts(&Utc::now()),
                ],
            )
            .map_err(db_err("Insert job"))?;
        Ok(())
    }

    /// Claim the oldest ready job on `topic`: mark it running and count
    /// the attempt. Claiming happens under the connection lock, so two
    /// consumers can never take the same job.
    pub fn claim_next_job(&self, topic: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let next = conn
            .query_row(
                "SELECT id, topic, payload, ready_at, attempts, job_key FROM jobs
                 WHERE topic = ?1 AND state = 'queued' AND ready_at <= ?2
                 ORDER BY ready_at, rowid LIMIT 1",
                params![topic, now.timestamp_millis()],
                job_from_row,
            )
            .optional()
            .map_err(db_err("Claim job"))?;
        let Some(mut job) = next else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE jobs SET state = 'running', attempts = attempts + 1 WHERE id = ?1",
            params![job.id],
        )
        .map_err(db_err("Claim job"))?;
        job.attempts += 1;
        Ok(Some(job))
    }

    pub fn complete_job(&self, id: &str) -> Result<()> {
        self.set_job_state(id, JobState::Done, None, None)
    }

    /// Put a failed job back in the queue, visible again at `ready_at`.
    pub fn retry_job(&self, id: &str, ready_at: DateTime<Utc>, error: &str) -> Result<()> {
        self.set_job_state(id, JobState::Queued, Some(ready_at), Some(error))
    }

    /// Park a job that ran out of attempts.
    pub fn bury_job(&self, id: &str, error: &str) -> Result<()> {
        self.set_job_state(id, JobState::Dead, None, Some(error))
    }

    fn set_job_state(
        &self,
        id: &str,
        state: JobState,
        ready_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE jobs SET state = ?2,
                     ready_at = COALESCE(?3, ready_at),
                     last_error = COALESCE(?4, last_error)
                 WHERE id = ?1",
                params![id, state.as_str(), ready_at.map(|t| t.timestamp_millis()), error],
            )
            .map_err(db_err("Update job"))?;
        if changed == 0 {
            return Err(EngageError::not_found("job", id));
        }
        Ok(())
    }

    /// Remove queued jobs carrying `key`. Running jobs are left alone.
    pub fn cancel_jobs(&self, key: &str) -> Result<usize> {
        self.conn()?
            .execute(
                "DELETE FROM jobs WHERE job_key = ?1 AND state = 'queued'",
                params![key],
            )
            .map_err(db_err("Cancel jobs"))
    }

    /// Return jobs left running by a previous process to the queue.
    pub fn requeue_running_jobs(&self, topic: &str) -> Result<usize> {
        self.conn()?
            .execute(
                "UPDATE jobs SET state = 'queued' WHERE topic = ?1 AND state = 'running'",
                params![topic],
            )
            .map_err(db_err("Requeue jobs"))
    }

    pub fn count_jobs(&self, topic: &str, state: JobState) -> Result<u64> {
        let n: i64 = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM jobs WHERE topic = ?1 AND state = ?2",
                params![topic, state.as_str()],
                |r| r.get(0),
            )
            .map_err(db_err("Count jobs"))?;
        Ok(n as u64)
    }

    /// Jobs on `topic` in a given state, soonest first.
    pub fn list_jobs(&self, topic: &str, state: JobState) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, topic, payload, ready_at, attempts, job_key FROM jobs
                 WHERE topic = ?1 AND state = ?2 ORDER BY ready_at, rowid",
            )
            .map_err(db_err("List jobs"))?;
        let rows = stmt
            .query_map(params![topic, state.as_str()], job_from_row)
            .map_err(db_err("List jobs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List jobs"))
    }
}
