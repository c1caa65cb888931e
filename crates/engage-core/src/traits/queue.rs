//! Delayed job queue contract.
//!
//! A job is a `(topic, payload)` pair that becomes visible to the topic's
//! consumer once its delay has elapsed. Delivery is at-least-once: a handler
//! may see the same job again after a crash, so handlers must be idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::types::Payload;

pub type JobId = String;

/// A unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub topic: String,
    pub payload: Payload,
    pub ready_at: DateTime<Utc>,
    /// Attempts made so far, including the one in progress.
    pub attempts: u32,
    /// Optional caller key used to cancel pending jobs as a group.
    pub key: Option<String>,
}

/// Consumer callback for one topic.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Schedule `payload` on `topic`, visible after `delay`.
    /// Fails with `SchedulingUnavailable` when the queue cannot accept work.
    async fn enqueue(
        &self,
        topic: &str,
        payload: Payload,
        delay: Duration,
        key: Option<&str>,
    ) -> Result<JobId>;

    /// Drop every not-yet-started job carrying `key`. Returns how many were removed.
    async fn cancel(&self, key: &str) -> Result<usize>;

    /// Run `handler` for each ready job on `topic`, one job at a time,
    /// until the queue shuts down.
    async fn consume(&self, topic: &str, handler: Arc<dyn JobHandler>) -> Result<()>;
}
