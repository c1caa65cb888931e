//! Delivery worker: consumes "send-campaign" and "send-follow-up" jobs.
//!
//! Recipients are sent one at a time with a fixed pause between sends.
//! A failed recipient is recorded and the batch moves on. Both handlers
//! re-read the campaign first and do nothing when it is no longer eligible,
//! which is how cancellation wins over jobs that are already queued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use engage_core::error::{EngageError, Result};
use engage_core::traits::{ChannelMap, Job, JobHandler, JobQueue};
use engage_core::types::{Campaign, CampaignStatus, RecipientRecord, RecipientStatus};
use engage_db::EngageDb;
use serde::{Deserialize, Serialize};

use crate::fanout::RecipientFanout;
use crate::followup::{self, SendFollowUpJob};
use crate::render::render_variables;
use crate::{SEND_CAMPAIGN, SEND_FOLLOW_UP};

/// Payload of a "send-campaign" job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCampaignJob {
    pub campaign_id: String,
}

/// Counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub sent: usize,
    pub failed: usize,
    /// No deliverable address on any configured channel.
    pub skipped: usize,
}

/// Initial sends update the recipient record; follow-ups only log.
#[derive(Clone, Copy, PartialEq, Eq)]
enum BatchKind {
    Initial,
    FollowUp,
}

enum RecipientOutcome {
    Sent(String),
    Failed(String),
    NoAddress,
}

pub struct DeliveryWorker {
    db: Arc<EngageDb>,
    fanout: RecipientFanout,
    channels: ChannelMap,
    queue: Arc<dyn JobQueue>,
    send_interval: Duration,
}

impl DeliveryWorker {
    pub fn new(
        db: Arc<EngageDb>,
        fanout: RecipientFanout,
        channels: ChannelMap,
        queue: Arc<dyn JobQueue>,
        send_interval: Duration,
    ) -> Self {
        Self {
            db,
            fanout,
            channels,
            queue,
            send_interval,
        }
    }

    /// Process a send-campaign job. `None` means the campaign was missing
    /// or not eligible and nothing was done.
    pub async fn send_campaign(&self, campaign_id: &str) -> Result<Option<BatchSummary>> {
        let Some(campaign) = self.db.get_campaign(campaign_id)? else {
            tracing::warn!("⚠️ send-campaign: campaign {campaign_id} no longer exists");
            return Ok(None);
        };
        // `sending` is accepted so a redelivered job can finish a crashed batch.
        let claimed = self.db.transition_campaign(
            campaign_id,
            &[CampaignStatus::Scheduled, CampaignStatus::Sending],
            CampaignStatus::Sending,
            Utc::now(),
        )?;
        if !claimed {
            tracing::info!(
                "⏭️ Campaign '{}' is {}, skipping send job",
                campaign.name,
                campaign.status
            );
            return Ok(None);
        }
        tracing::info!("📣 Campaign '{}' sending", campaign.name);

        let summary = match self.run_initial_batch(&campaign).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!("❌ Campaign '{}' failed: {e}", campaign.name);
                self.db.transition_campaign(
                    campaign_id,
                    &[CampaignStatus::Sending],
                    CampaignStatus::Failed,
                    Utc::now(),
                )?;
                return Ok(None);
            }
        };

        // Follow-ups go on the queue before `sent`. If the queue refuses them
        // the job errors and the campaign stays `sending`; the retry only
        // re-sends still-pending records.
        if let Err(e) = followup::schedule_follow_ups(self.queue.as_ref(), &campaign).await {
            tracing::error!(
                "❌ Could not schedule follow-ups for '{}', will retry: {e}",
                campaign.name
            );
            return Err(e);
        }
        self.db.transition_campaign(
            campaign_id,
            &[CampaignStatus::Sending],
            CampaignStatus::Sent,
            Utc::now(),
        )?;
        tracing::info!(
            "✅ Campaign '{}' sent: {} sent, {} failed, {} skipped",
            campaign.name,
            summary.sent,
            summary.failed,
            summary.skipped
        );
        Ok(Some(summary))
    }

    async fn run_initial_batch(&self, campaign: &Campaign) -> Result<BatchSummary> {
        self.fanout.expand(campaign).await?;
        let pending = self
            .db
            .list_recipients(&campaign.id, Some(&[RecipientStatus::Pending]))?;
        self.dispatch(campaign, &campaign.template_id, &pending, BatchKind::Initial)
            .await
    }

    /// Process a send-follow-up job. `None` when the campaign or rule is
    /// gone or the campaign was never sent. Errors while the initial batch
    /// is still `sending`, so the queue hands the job back later.
    pub async fn send_follow_up(
        &self,
        campaign_id: &str,
        follow_up_id: &str,
    ) -> Result<Option<BatchSummary>> {
        let Some(campaign) = self.db.get_campaign(campaign_id)? else {
            return Ok(None);
        };
        let Some(rule) = campaign.follow_up(follow_up_id) else {
            tracing::warn!("⚠️ Follow-up {follow_up_id} no longer on campaign '{}'", campaign.name);
            return Ok(None);
        };
        if campaign.status == CampaignStatus::Sending {
            return Err(EngageError::InvalidState(format!(
                "campaign '{}' is still sending",
                campaign.name
            )));
        }
        if campaign.status != CampaignStatus::Sent {
            tracing::info!(
                "⏭️ Campaign '{}' is {}, skipping follow-up",
                campaign.name,
                campaign.status
            );
            return Ok(None);
        }

        let recipients = followup::select_recipients(&self.db, campaign_id, rule)?;
        tracing::info!(
            "🔁 Follow-up {} for '{}': {} recipient(s)",
            rule.id,
            campaign.name,
            recipients.len()
        );
        let summary = self
            .dispatch(&campaign, &rule.template_id, &recipients, BatchKind::FollowUp)
            .await?;
        Ok(Some(summary))
    }

    async fn dispatch(
        &self,
        campaign: &Campaign,
        template_id: &str,
        recipients: &[RecipientRecord],
        kind: BatchKind,
    ) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        let mut first = true;

        for record in recipients {
            let member = record.member();
            let variables = render_variables(&campaign.template_variables, &member);

            let mut message_id = None;
            let mut errors = Vec::new();
            for channel in &campaign.channels {
                let Some(address) = member.address_for(channel) else {
                    continue;
                };
                if !first {
                    tokio::time::sleep(self.send_interval).await;
                }
                first = false;

                let Some(adapter) = self.channels.get(channel) else {
                    errors.push(format!("{channel}: no adapter configured"));
                    continue;
                };
                match adapter
                    .send_template(address, template_id, &campaign.locale, &variables)
                    .await
                {
                    Ok(receipt) => {
                        message_id.get_or_insert(receipt.external_message_id);
                    }
                    Err(e) => errors.push(format!("{channel}: {e}")),
                }
            }

            let outcome = match (message_id, errors.is_empty()) {
                (Some(id), _) => RecipientOutcome::Sent(id),
                (None, false) => RecipientOutcome::Failed(errors.join("; ")),
                (None, true) => RecipientOutcome::NoAddress,
            };
            self.record_outcome(campaign, record, outcome, kind, &mut summary)?;
        }
        Ok(summary)
    }

    fn record_outcome(
        &self,
        campaign: &Campaign,
        record: &RecipientRecord,
        outcome: RecipientOutcome,
        kind: BatchKind,
        summary: &mut BatchSummary,
    ) -> Result<()> {
        let now = Utc::now();
        match outcome {
            RecipientOutcome::Sent(id) => {
                summary.sent += 1;
                if kind == BatchKind::Initial {
                    self.db
                        .mark_recipient_sent(&campaign.id, &record.recipient_id, &id, now)?;
                }
            }
            RecipientOutcome::Failed(reason) => {
                summary.failed += 1;
                tracing::warn!(
                    "⚠️ Campaign '{}': send to {} failed: {reason}",
                    campaign.name,
                    record.recipient_id
                );
                if kind == BatchKind::Initial {
                    self.db
                        .mark_recipient_failed(&campaign.id, &record.recipient_id, &reason, now)?;
                }
            }
            RecipientOutcome::NoAddress => {
                summary.skipped += 1;
                tracing::debug!(
                    "Campaign '{}': {} has no deliverable address",
                    campaign.name,
                    record.recipient_id
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for DeliveryWorker {
    async fn handle(&self, job: &Job) -> Result<()> {
        match job.topic.as_str() {
            SEND_CAMPAIGN => {
                let payload: SendCampaignJob = serde_json::from_value(job.payload.clone())?;
                self.send_campaign(&payload.campaign_id).await?;
            }
            SEND_FOLLOW_UP => {
                let payload: SendFollowUpJob = serde_json::from_value(job.payload.clone())?;
                self.send_follow_up(&payload.campaign_id, &payload.follow_up_id)
                    .await?;
            }
            other => {
                return Err(EngageError::Other(format!(
                    "delivery worker cannot handle topic '{other}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_core::traits::{ChannelAdapter, DeliveryReceipt, TargetListResolver};
    use engage_core::types::{
        CampaignInput, DelayUnit, FollowUpCondition, FollowUpRule, ListMember,
    };
    use engage_db::JobState;
    use engage_scheduler::SqliteJobQueue;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records sends; fails for addresses listed in `reject`.
    struct FakeChannel {
        reject: Vec<String>,
        sent: Mutex<Vec<(String, String, BTreeMap<String, String>)>>,
    }

    #[async_trait]
    impl ChannelAdapter for FakeChannel {
        fn name(&self) -> &str {
            "whatsapp"
        }

        async fn send_template(
            &self,
            address: &str,
            template_id: &str,
            _locale: &str,
            variables: &BTreeMap<String, String>,
        ) -> Result<DeliveryReceipt> {
            if self.reject.iter().any(|a| a == address) {
                return Err(EngageError::ExternalDelivery("number not on WhatsApp".into()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((address.into(), template_id.into(), variables.clone()));
            Ok(DeliveryReceipt {
                external_message_id: format!("wamid.{}", sent.len()),
            })
        }
    }

    /// List lookup that always errors, standing in for a store outage.
    struct BrokenLists;

    #[async_trait]
    impl TargetListResolver for BrokenLists {
        async fn resolve(&self, list_id: &str) -> Result<Vec<ListMember>> {
            Err(EngageError::Database(format!("list {list_id} unreadable")))
        }
    }

    struct Harness {
        db: Arc<EngageDb>,
        channel: Arc<FakeChannel>,
        queue: Arc<SqliteJobQueue>,
        worker: DeliveryWorker,
    }

    impl Harness {
        /// Another worker over the same store and channel.
        fn worker_with(
            &self,
            resolver: Arc<dyn TargetListResolver>,
            queue: Arc<SqliteJobQueue>,
        ) -> DeliveryWorker {
            let mut channels = ChannelMap::new();
            channels.insert("whatsapp".into(), self.channel.clone());
            DeliveryWorker::new(
                self.db.clone(),
                RecipientFanout::new(self.db.clone(), resolver),
                channels,
                queue,
                Duration::from_millis(1000),
            )
        }
    }

    fn harness(reject: &[&str]) -> Harness {
        let db = Arc::new(EngageDb::open_in_memory().unwrap());
        let channel = Arc::new(FakeChannel {
            reject: reject.iter().map(|s| s.to_string()).collect(),
            sent: Mutex::new(Vec::new()),
        });
        let mut channels = ChannelMap::new();
        channels.insert("whatsapp".into(), channel.clone());
        let queue = Arc::new(SqliteJobQueue::new(db.clone(), Default::default()));
        let worker = DeliveryWorker::new(
            db.clone(),
            RecipientFanout::new(db.clone(), db.clone()),
            channels,
            queue.clone(),
            Duration::from_millis(1000),
        );
        Harness { db, channel, queue, worker }
    }

    fn seed(db: &EngageDb, status: CampaignStatus, addresses: &[Option<&str>]) -> Campaign {
        for (i, address) in addresses.iter().enumerate() {
            db.add_list_member(
                "list-1",
                &ListMember {
                    recipient_id: format!("r{i}"),
                    address: address.map(String::from),
                    fields: BTreeMap::from([("name".to_string(), format!("Guest {i}"))]),
                },
            )
            .unwrap();
        }
        let mut campaign = CampaignInput {
            name: "Promo".into(),
            list_id: "list-1".into(),
            channels: vec!["whatsapp".into()],
            template_id: "promo_v2".into(),
            template_variables: BTreeMap::from([("1".to_string(), "{{name}}".to_string())]),
            follow_ups: vec![FollowUpRule {
                id: "nudge".into(),
                template_id: "promo_nudge".into(),
                condition: FollowUpCondition::IfNoResponse,
                delay: 1,
                delay_unit: DelayUnit::Days,
                order: 0,
            }],
            ..Default::default()
        }
        .into_campaign(status, "en");
        campaign.scheduled_at = Some(Utc::now());
        db.save_campaign(&campaign).unwrap();
        campaign
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_abort_batch() {
        let h = harness(&["+2"]);
        let campaign = seed(&h.db, CampaignStatus::Scheduled, &[Some("+1"), Some("+2"), Some("+3")]);

        let started = tokio::time::Instant::now();
        let summary = h.worker.send_campaign(&campaign.id).await.unwrap().unwrap();
        assert_eq!(summary, BatchSummary { sent: 2, failed: 1, skipped: 0 });
        // two pauses between three sends
        assert!(started.elapsed() >= Duration::from_secs(2));

        let failed = h.db.get_recipient(&campaign.id, "r1").unwrap().unwrap();
        assert_eq!(failed.status, RecipientStatus::Failed);
        assert!(failed.failure_reason.unwrap().contains("not on WhatsApp"));
        let third = h.db.get_recipient(&campaign.id, "r2").unwrap().unwrap();
        assert_eq!(third.status, RecipientStatus::Sent);
        assert!(third.external_message_id.is_some());

        let sent = h.channel.sent.lock().unwrap();
        assert_eq!(sent[0].2.get("1").unwrap(), "Guest 0");

        let stored = h.db.get_campaign(&campaign.id).unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Sent);
        assert!(stored.sent_at.is_some());
        assert_eq!(h.db.count_jobs(SEND_FOLLOW_UP, JobState::Queued).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_campaign_is_noop() {
        let h = harness(&[]);
        let campaign = seed(&h.db, CampaignStatus::Cancelled, &[Some("+1")]);
        assert!(h.worker.send_campaign(&campaign.id).await.unwrap().is_none());
        assert_eq!(h.db.count_recipients(&campaign.id).unwrap(), 0);
        assert_eq!(
            h.db.get_campaign(&campaign.id).unwrap().unwrap().status,
            CampaignStatus::Cancelled
        );
        assert!(h.worker.send_campaign("missing").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_address_is_skipped() {
        let h = harness(&[]);
        let campaign = seed(&h.db, CampaignStatus::Scheduled, &[None, Some("+1")]);
        let summary = h.worker.send_campaign(&campaign.id).await.unwrap().unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            h.db.get_recipient(&campaign.id, "r0").unwrap().unwrap().status,
            RecipientStatus::Pending
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_job_sends_only_pending() {
        let h = harness(&[]);
        let campaign = seed(&h.db, CampaignStatus::Sending, &[Some("+1"), Some("+2")]);
        // first recipient went out before the crash
        h.db.insert_recipients(&campaign.id, &h.db.list_members("list-1").unwrap())
            .unwrap();
        h.db.mark_recipient_sent(&campaign.id, "r0", "wamid.old", Utc::now())
            .unwrap();

        let summary = h.worker.send_campaign(&campaign.id).await.unwrap().unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(h.channel.sent.lock().unwrap()[0].0, "+2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_error_fails_campaign_and_keeps_sent() {
        let h = harness(&[]);
        let campaign = seed(&h.db, CampaignStatus::Sending, &[Some("+1"), Some("+2")]);
        h.db.insert_recipients(&campaign.id, &h.db.list_members("list-1").unwrap())
            .unwrap();
        h.db.mark_recipient_sent(&campaign.id, "r0", "wamid.old", Utc::now())
            .unwrap();

        let worker = h.worker_with(Arc::new(BrokenLists), h.queue.clone());
        assert!(worker.send_campaign(&campaign.id).await.unwrap().is_none());

        let stored = h.db.get_campaign(&campaign.id).unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Failed);
        let kept = h.db.get_recipient(&campaign.id, "r0").unwrap().unwrap();
        assert_eq!(kept.status, RecipientStatus::Sent);
        assert_eq!(kept.external_message_id.as_deref(), Some("wamid.old"));
        assert_eq!(
            h.db.get_recipient(&campaign.id, "r1").unwrap().unwrap().status,
            RecipientStatus::Pending
        );
        assert!(h.channel.sent.lock().unwrap().is_empty());
        assert_eq!(h.db.count_jobs(SEND_FOLLOW_UP, JobState::Queued).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_queue_outage_retries_send_job() {
        let h = harness(&[]);
        let campaign = seed(&h.db, CampaignStatus::Scheduled, &[Some("+1"), Some("+2")]);
        h.queue.shutdown();

        let err = h.worker.send_campaign(&campaign.id).await.unwrap_err();
        assert_eq!(err.code(), "SCHEDULING_UNAVAILABLE");
        // not marked sent, so the job is retried rather than losing follow-ups
        let stored = h.db.get_campaign(&campaign.id).unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Sending);
        assert_eq!(h.channel.sent.lock().unwrap().len(), 2);
        assert_eq!(h.db.count_jobs(SEND_FOLLOW_UP, JobState::Queued).unwrap(), 0);

        let queue = Arc::new(SqliteJobQueue::new(h.db.clone(), Default::default()));
        let worker = h.worker_with(h.db.clone(), queue);
        let summary = worker.send_campaign(&campaign.id).await.unwrap().unwrap();
        assert_eq!(summary.sent, 0);
        assert_eq!(h.channel.sent.lock().unwrap().len(), 2);
        assert_eq!(
            h.db.get_campaign(&campaign.id).unwrap().unwrap().status,
            CampaignStatus::Sent
        );
        assert_eq!(h.db.count_jobs(SEND_FOLLOW_UP, JobState::Queued).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_waits_for_send_to_finish() {
        let h = harness(&[]);
        let campaign = seed(&h.db, CampaignStatus::Sending, &[Some("+1")]);
        let err = h.worker.send_follow_up(&campaign.id, "nudge").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        assert!(h.channel.sent.lock().unwrap().is_empty());

        let draft = seed(&h.db, CampaignStatus::Draft, &[]);
        assert!(h.worker.send_follow_up(&draft.id, "nudge").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_targets_unreplied() {
        let h = harness(&[]);
        let campaign = seed(&h.db, CampaignStatus::Scheduled, &[Some("+1"), Some("+2")]);
        h.worker.send_campaign(&campaign.id).await.unwrap();

        let replied = h.db.get_recipient(&campaign.id, "r0").unwrap().unwrap();
        h.db.apply_delivery_event(
            replied.external_message_id.as_deref().unwrap(),
            &engage_core::types::DeliveryEvent::Replied,
            Utc::now(),
        )
        .unwrap();

        let summary = h
            .worker
            .send_follow_up(&campaign.id, "nudge")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.sent, 1);
        let sent = h.channel.sent.lock().unwrap();
        let last = sent.last().unwrap();
        assert_eq!(last.0, "+2");
        assert_eq!(last.1, "promo_nudge");

        drop(sent);
        assert!(h.worker.send_follow_up(&campaign.id, "gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handler_routes_topics() {
        let h = harness(&[]);
        let job = Job {
            id: "j1".into(),
            topic: "unknown-topic".into(),
            payload: serde_json::json!({}),
            ready_at: Utc::now(),
            attempts: 1,
            key: None,
        };
        assert!(h.worker.handle(&job).await.is_err());

        let job = Job {
            topic: SEND_CAMPAIGN.into(),
            payload: serde_json::json!({"campaign_id": "missing"}),
            ..job
        };
        assert!(h.worker.handle(&job).await.is_ok());
    }
}
