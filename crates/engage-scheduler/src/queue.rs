//! SQLite-backed delayed job queue.
//!
//! Each `consume` call owns one topic and runs its jobs strictly one at a
//! time: claim the oldest ready job, run the handler, then complete, retry
//! or bury it. An idle consumer sleeps for the poll interval or until a new
//! job is enqueued, whichever comes first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use engage_core::config::QueueConfig;
use engage_core::error::{EngageError, Result};
use engage_core::traits::{Job, JobHandler, JobId, JobQueue};
use engage_core::types::{Payload, new_id};
use engage_db::EngageDb;
use tokio::sync::Notify;

pub struct SqliteJobQueue {
    db: Arc<EngageDb>,
    config: QueueConfig,
    stopped: AtomicBool,
    wake: Notify,
}

impl SqliteJobQueue {
    pub fn new(db: Arc<EngageDb>, config: QueueConfig) -> Self {
        Self {
            db,
            config,
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Stop accepting work and let every consumer loop return.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        tracing::info!("🛑 Job queue shutting down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run every job on `topic` that is ready now, one after another.
    /// Returns how many jobs were handled.
    pub async fn run_ready(&self, topic: &str, handler: &dyn JobHandler) -> Result<usize> {
        let mut handled = 0;
        while !self.is_shut_down() {
            let Some(job) = self.db.claim_next_job(topic, Utc::now())? else {
                break;
            };
            self.process(&job, handler).await?;
            handled += 1;
        }
        Ok(handled)
    }

    async fn process(&self, job: &Job, handler: &dyn JobHandler) -> Result<()> {
        tracing::debug!("📦 Job {} on '{}' (attempt {})", job.id, job.topic, job.attempts);
        match handler.handle(job).await {
            Ok(()) => self.db.complete_job(&job.id),
            Err(e) if job.attempts >= self.config.max_attempts => {
                tracing::error!(
                    "💀 Job {} on '{}' failed {} times, giving up: {e}",
                    job.id,
                    job.topic,
                    job.attempts
                );
                self.db.bury_job(&job.id, &e.to_string())
            }
            Err(e) => {
                let backoff = self
                    .config
                    .retry_delay_secs
                    .saturating_mul(job.attempts as u64);
                tracing::warn!(
                    "⚠️ Job {} on '{}' failed (attempt {}), retrying in {backoff}s: {e}",
                    job.id,
                    job.topic,
                    job.attempts
                );
                let ready_at = Utc::now() + chrono::Duration::seconds(backoff as i64);
                self.db.retry_job(&job.id, ready_at, &e.to_string())
            }
        }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(
        &self,
        topic: &str,
        payload: Payload,
        delay: Duration,
        key: Option<&str>,
    ) -> Result<JobId> {
        if self.is_shut_down() {
            return Err(EngageError::SchedulingUnavailable(
                "job queue is shut down".into(),
            ));
        }
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| EngageError::ValidationFailed(format!("delay out of range: {e}")))?;
        let ready_at = Utc::now()
            .checked_add_signed(delay)
            .ok_or_else(|| EngageError::ValidationFailed("delay out of range".into()))?;
        let job = Job {
            id: new_id(),
            topic: topic.to_string(),
            payload,
            ready_at,
            attempts: 0,
            key: key.map(String::from),
        };
        self.db
            .insert_job(&job)
            .map_err(|e| EngageError::SchedulingUnavailable(e.to_string()))?;
        tracing::info!(
            "⏳ Job {} queued on '{}' (ready at {})",
            job.id,
            topic,
            job.ready_at.to_rfc3339()
        );
        self.wake.notify_waiters();
        Ok(job.id)
    }

    async fn cancel(&self, key: &str) -> Result<usize> {
        let removed = self.db.cancel_jobs(key)?;
        if removed > 0 {
            tracing::info!("🗑️ Cancelled {removed} queued job(s) for '{key}'");
        }
        Ok(removed)
    }

    async fn consume(&self, topic: &str, handler: Arc<dyn JobHandler>) -> Result<()> {
        let recovered = self.db.requeue_running_jobs(topic)?;
        if recovered > 0 {
            tracing::warn!("♻️ Recovered {recovered} interrupted job(s) on '{topic}'");
        }
        tracing::info!(
            "⏰ Consumer started for '{topic}' (poll every {}ms)",
            self.config.poll_interval_ms
        );

        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        while !self.is_shut_down() {
            let handled = match self.run_ready(topic, handler.as_ref()).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("❌ Consumer for '{topic}' hit a store error: {e}");
                    0
                }
            };
            if handled == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = self.wake.notified() => {}
                }
            }
        }
        tracing::info!("👋 Consumer for '{topic}' stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        seen: Mutex<Vec<Payload>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: &Job) -> Result<()> {
            self.seen.lock().unwrap().push(job.payload.clone());
            Ok(())
        }
    }

    struct AlwaysFails {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for AlwaysFails {
        async fn handle(&self, _job: &Job) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EngageError::Other("boom".into()))
        }
    }

    fn queue(max_attempts: u32) -> SqliteJobQueue {
        let db = Arc::new(EngageDb::open_in_memory().unwrap());
        SqliteJobQueue::new(
            db,
            QueueConfig {
                poll_interval_ms: 10,
                max_attempts,
                retry_delay_secs: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_delayed_job_not_ready_early() {
        let q = queue(3);
        q.enqueue("t", serde_json::json!({"n": 1}), Duration::from_secs(3600), None)
            .await
            .unwrap();
        q.enqueue("t", serde_json::json!({"n": 2}), Duration::ZERO, None)
            .await
            .unwrap();

        let rec = Recorder { seen: Mutex::new(Vec::new()) };
        assert_eq!(q.run_ready("t", &rec).await.unwrap(), 1);
        assert_eq!(rec.seen.lock().unwrap()[0]["n"], 2);
        assert_eq!(q.db.count_jobs("t", engage_db::JobState::Queued).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failing_job_is_buried_after_max_attempts() {
        let q = queue(2);
        q.enqueue("t", serde_json::json!({}), Duration::ZERO, None)
            .await
            .unwrap();
        let handler = AlwaysFails { calls: AtomicUsize::new(0) };

        // retry delay is zero, so both attempts run in one pass
        q.run_ready("t", &handler).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(q.db.count_jobs("t", engage_db::JobState::Dead).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_delay_is_rejected() {
        let q = queue(3);
        // fits a chrono duration but lands past the last representable date
        let million_years = Duration::from_secs(1_000_000 * 365 * 86_400);
        for delay in [million_years, Duration::from_secs(u64::MAX)] {
            let err = q
                .enqueue("t", serde_json::json!({}), delay, Some("campaign:c1"))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "VALIDATION_FAILED");
        }
        assert_eq!(q.db.count_jobs("t", engage_db::JobState::Queued).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_and_shutdown() {
        let q = queue(3);
        q.enqueue("t", serde_json::json!({}), Duration::from_secs(60), Some("campaign:c1"))
            .await
            .unwrap();
        assert_eq!(q.cancel("campaign:c1").await.unwrap(), 1);

        q.shutdown();
        let err = q
            .enqueue("t", serde_json::json!({}), Duration::ZERO, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SCHEDULING_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_consume_loop_runs_and_stops() {
        let q = Arc::new(queue(3));
        let rec = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });

        let consumer = {
            let q = q.clone();
            let handler: Arc<dyn JobHandler> = rec.clone();
            tokio::spawn(async move { q.consume("t", handler).await })
        };
        q.enqueue("t", serde_json::json!({"n": 7}), Duration::ZERO, None)
            .await
            .unwrap();

        for _ in 0..200 {
            if !rec.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        q.shutdown();
        consumer.await.unwrap().unwrap();
        assert_eq!(rec.seen.lock().unwrap().len(), 1);
    }
}
