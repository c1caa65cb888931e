//! Campaign lifecycle: create, update, delete, cancel, start, read-side queries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use engage_core::error::{EngageError, Result};
use engage_core::traits::JobQueue;
use engage_core::types::{
    Campaign, CampaignAnalytics, CampaignInput, CampaignPatch, CampaignStatus, DeliveryEvent,
    Page, PageRequest,
};
use engage_db::EngageDb;

use crate::delivery::SendCampaignJob;
use crate::{SEND_CAMPAIGN, job_key};

pub struct CampaignScheduler {
    db: Arc<EngageDb>,
    queue: Arc<dyn JobQueue>,
    default_locale: String,
}

/// Time left until `at`, zero when it is already past.
fn delay_until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

impl CampaignScheduler {
    pub fn new(db: Arc<EngageDb>, queue: Arc<dyn JobQueue>, default_locale: &str) -> Self {
        Self {
            db,
            queue,
            default_locale: default_locale.to_string(),
        }
    }

    /// Persist a new campaign. With `scheduled_at` set it becomes
    /// `scheduled` and a send job is queued; otherwise it stays `draft`.
    pub async fn create(&self, input: CampaignInput) -> Result<Campaign> {
        input.validate()?;
        let status = if input.scheduled_at.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };
        let mut campaign = input.into_campaign(status, &self.default_locale);
        self.db.save_campaign(&campaign)?;

        if let Some(at) = campaign.scheduled_at {
            self.schedule_send(&mut campaign, at).await?;
        }
        tracing::info!("📣 Campaign '{}' created ({})", campaign.name, campaign.status);
        Ok(campaign)
    }

    /// Edit a draft or scheduled campaign. A new `scheduled_at` replaces
    /// the queued send job.
    pub async fn update(&self, id: &str, patch: CampaignPatch) -> Result<Campaign> {
        let mut campaign = self.get(id)?;
        let editable = [CampaignStatus::Draft, CampaignStatus::Scheduled];
        if !editable.contains(&campaign.status) {
            return Err(EngageError::InvalidState(format!(
                "campaign '{}' is {} and can no longer be edited",
                campaign.name, campaign.status
            )));
        }

        let previous = campaign.scheduled_at;
        patch.apply(&mut campaign)?;
        let reschedule = campaign.scheduled_at != previous;
        if reschedule && campaign.scheduled_at.is_some() {
            campaign.status = CampaignStatus::Scheduled;
        }

        if !self.db.save_campaign_if(&campaign, &editable)? {
            return Err(EngageError::InvalidState(format!(
                "campaign '{}' changed state during the update",
                campaign.name
            )));
        }

        if reschedule {
            self.queue.cancel(&job_key(id)).await?;
            if let Some(at) = campaign.scheduled_at {
                self.schedule_send(&mut campaign, at).await?;
            }
        }
        tracing::info!("✏️ Campaign '{}' updated", campaign.name);
        Ok(campaign)
    }

    /// Delete a draft campaign.
    pub fn delete(&self, id: &str) -> Result<()> {
        let campaign = self.get(id)?;
        if campaign.status != CampaignStatus::Draft {
            return Err(EngageError::InvalidState(format!(
                "only draft campaigns can be deleted, '{}' is {}",
                campaign.name, campaign.status
            )));
        }
        self.db.delete_campaign(id)?;
        tracing::info!("🗑️ Campaign '{}' deleted", campaign.name);
        Ok(())
    }

    /// Cancel a scheduled campaign. Queued jobs are dropped best-effort;
    /// the delivery worker re-checks status either way.
    pub async fn cancel(&self, id: &str) -> Result<Campaign> {
        let cancelled = self.db.transition_campaign(
            id,
            &[CampaignStatus::Scheduled],
            CampaignStatus::Cancelled,
            Utc::now(),
        )?;
        let campaign = self.get(id)?;
        if !cancelled {
            return Err(EngageError::InvalidState(format!(
                "only scheduled campaigns can be cancelled, '{}' is {}",
                campaign.name, campaign.status
            )));
        }

        if let Err(e) = self.queue.cancel(&job_key(id)).await {
            tracing::warn!("⚠️ Could not drop queued jobs for '{}': {e}", campaign.name);
        }
        tracing::info!("🛑 Campaign '{}' cancelled", campaign.name);
        Ok(campaign)
    }

    /// Send now: draft or scheduled → scheduled at the current time with an
    /// immediate send job.
    pub async fn start(&self, id: &str) -> Result<Campaign> {
        let mut campaign = self.get(id)?;
        let startable = [CampaignStatus::Draft, CampaignStatus::Scheduled];
        if !startable.contains(&campaign.status) {
            return Err(EngageError::InvalidState(format!(
                "campaign '{}' is {} and cannot be started",
                campaign.name, campaign.status
            )));
        }

        let now = Utc::now();
        campaign.status = CampaignStatus::Scheduled;
        campaign.scheduled_at = Some(now);
        campaign.updated_at = now;
        if !self.db.save_campaign_if(&campaign, &startable)? {
            return Err(EngageError::InvalidState(format!(
                "campaign '{}' changed state before it could start",
                campaign.name
            )));
        }

        self.queue.cancel(&job_key(id)).await?;
        self.schedule_send(&mut campaign, now).await?;
        tracing::info!("🚀 Campaign '{}' started", campaign.name);
        Ok(campaign)
    }

    pub fn get(&self, id: &str) -> Result<Campaign> {
        self.db
            .get_campaign(id)?
            .ok_or_else(|| EngageError::not_found("campaign", id))
    }

    pub fn list(&self, status: Option<CampaignStatus>, req: PageRequest) -> Result<Page<Campaign>> {
        self.db.list_campaigns(status, req)
    }

    pub fn analytics(&self, id: &str) -> Result<CampaignAnalytics> {
        self.get(id)?;
        let stats = self.db.campaign_stats(id)?;
        let timeline = self.db.send_timeline(id)?;
        Ok(CampaignAnalytics::new(id, stats, timeline))
    }

    /// Apply a provider status callback to the matching recipient record.
    /// Returns false when the event would move the record backwards.
    pub fn record_delivery_event(
        &self,
        external_message_id: &str,
        event: &DeliveryEvent,
    ) -> Result<bool> {
        let applied = self
            .db
            .apply_delivery_event(external_message_id, event, Utc::now())?;
        if !applied {
            tracing::debug!("Delivery event for {external_message_id} ignored");
        }
        Ok(applied)
    }

    /// Queue the send job. If the queue refuses it the campaign goes back
    /// to draft so it is never left scheduled with nothing to run it.
    async fn schedule_send(&self, campaign: &mut Campaign, at: DateTime<Utc>) -> Result<()> {
        let payload = serde_json::to_value(SendCampaignJob {
            campaign_id: campaign.id.clone(),
        })?;
        let delay = delay_until(at);
        match self
            .queue
            .enqueue(SEND_CAMPAIGN, payload, delay, Some(&job_key(&campaign.id)))
            .await
        {
            Ok(job_id) => {
                tracing::info!(
                    "⏰ Campaign '{}' send job {job_id} in {}s",
                    campaign.name,
                    delay.as_secs()
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("❌ Could not schedule campaign '{}': {e}", campaign.name);
                self.db.transition_campaign(
                    &campaign.id,
                    &[CampaignStatus::Scheduled],
                    CampaignStatus::Draft,
                    Utc::now(),
                )?;
                campaign.status = CampaignStatus::Draft;
                Err(match e {
                    EngageError::SchedulingUnavailable(_) => e,
                    other => EngageError::SchedulingUnavailable(other.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_core::types::ListMember;
    use engage_db::JobState;
    use engage_scheduler::SqliteJobQueue;

    fn setup() -> (Arc<EngageDb>, Arc<SqliteJobQueue>, CampaignScheduler) {
        let db = Arc::new(EngageDb::open_in_memory().unwrap());
        let queue = Arc::new(SqliteJobQueue::new(db.clone(), Default::default()));
        let scheduler = CampaignScheduler::new(db.clone(), queue.clone(), "en");
        (db, queue, scheduler)
    }

    fn input(scheduled_at: Option<DateTime<Utc>>) -> CampaignInput {
        CampaignInput {
            name: "Winter sale".into(),
            list_id: "list-1".into(),
            channels: vec!["whatsapp".into()],
            template_id: "winter_v1".into(),
            scheduled_at,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_draft_queues_nothing() {
        let (db, _, scheduler) = setup();
        let c = scheduler.create(input(None)).await.unwrap();
        assert_eq!(c.status, CampaignStatus::Draft);
        assert_eq!(c.locale, "en");
        assert_eq!(db.count_jobs(SEND_CAMPAIGN, JobState::Queued).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let (_, _, scheduler) = setup();
        let mut bad = input(None);
        bad.channels.clear();
        assert!(matches!(
            scheduler.create(bad).await,
            Err(EngageError::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_past_schedule_is_ready_now() {
        let (db, _, scheduler) = setup();
        let before = Utc::now();
        let c = scheduler
            .create(input(Some(before - chrono::Duration::hours(2))))
            .await
            .unwrap();
        assert_eq!(c.status, CampaignStatus::Scheduled);

        let jobs = db.list_jobs(SEND_CAMPAIGN, JobState::Queued).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].ready_at <= Utc::now());
        assert!(jobs[0].ready_at >= before - chrono::Duration::seconds(1));
        assert_eq!(jobs[0].key.as_deref(), Some(job_key(&c.id).as_str()));
    }

    #[tokio::test]
    async fn test_future_schedule_delays_job() {
        let (db, _, scheduler) = setup();
        let at = Utc::now() + chrono::Duration::hours(3);
        scheduler.create(input(Some(at))).await.unwrap();

        let job = &db.list_jobs(SEND_CAMPAIGN, JobState::Queued).unwrap()[0];
        let drift = (job.ready_at - at).num_milliseconds().abs();
        assert!(drift < 2_000, "drift {drift}ms");
    }

    #[tokio::test]
    async fn test_cancel_only_from_scheduled() {
        let (db, _, scheduler) = setup();
        let draft = scheduler.create(input(None)).await.unwrap();
        assert!(matches!(
            scheduler.cancel(&draft.id).await,
            Err(EngageError::InvalidState(_))
        ));
        assert_eq!(scheduler.get(&draft.id).unwrap().status, CampaignStatus::Draft);

        let scheduled = scheduler
            .create(input(Some(Utc::now() + chrono::Duration::days(1))))
            .await
            .unwrap();
        let cancelled = scheduler.cancel(&scheduled.id).await.unwrap();
        assert_eq!(cancelled.status, CampaignStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert_eq!(db.count_jobs(SEND_CAMPAIGN, JobState::Queued).unwrap(), 0);

        let sent = scheduler.create(input(Some(Utc::now()))).await.unwrap();
        for (from, to) in [
            (CampaignStatus::Scheduled, CampaignStatus::Sending),
            (CampaignStatus::Sending, CampaignStatus::Sent),
        ] {
            assert!(db.transition_campaign(&sent.id, &[from], to, Utc::now()).unwrap());
        }
        assert!(matches!(
            scheduler.cancel(&sent.id).await,
            Err(EngageError::InvalidState(_))
        ));
        let stored = scheduler.get(&sent.id).unwrap();
        assert_eq!(stored.status, CampaignStatus::Sent);
        assert!(stored.cancelled_at.is_none());

        assert!(matches!(
            scheduler.cancel("missing").await,
            Err(EngageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_and_delete_guards() {
        let (db, _, scheduler) = setup();
        let c = scheduler
            .create(input(Some(Utc::now() + chrono::Duration::days(1))))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::days(2);
        let updated = scheduler
            .update(
                &c.id,
                CampaignPatch {
                    name: Some("Winter sale II".into()),
                    scheduled_at: Some(later),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Winter sale II");
        let jobs = db.list_jobs(SEND_CAMPAIGN, JobState::Queued).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].ready_at > Utc::now() + chrono::Duration::hours(36));

        // only drafts can be deleted
        assert!(matches!(
            scheduler.delete(&c.id),
            Err(EngageError::InvalidState(_))
        ));

        db.transition_campaign(&c.id, &[CampaignStatus::Scheduled], CampaignStatus::Sending, Utc::now())
            .unwrap();
        assert!(matches!(
            scheduler.update(&c.id, CampaignPatch::default()).await,
            Err(EngageError::InvalidState(_))
        ));

        let draft = scheduler.create(input(None)).await.unwrap();
        scheduler.delete(&draft.id).unwrap();
        assert!(matches!(scheduler.get(&draft.id), Err(EngageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_start_queues_immediate_send() {
        let (db, _, scheduler) = setup();
        let c = scheduler.create(input(None)).await.unwrap();
        let started = scheduler.start(&c.id).await.unwrap();
        assert_eq!(started.status, CampaignStatus::Scheduled);
        let jobs = db.list_jobs(SEND_CAMPAIGN, JobState::Queued).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].ready_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_enqueue_failure_reverts_to_draft() {
        let (db, queue, scheduler) = setup();
        queue.shutdown();
        let err = scheduler
            .create(input(Some(Utc::now())))
            .await
            .unwrap_err();
        assert!(matches!(err, EngageError::SchedulingUnavailable(_)));

        let page = db.list_campaigns(None, PageRequest::default()).unwrap();
        assert_eq!(page.items[0].status, CampaignStatus::Draft);
    }

    #[tokio::test]
    async fn test_analytics_and_callbacks() {
        let (db, _, scheduler) = setup();
        let c = scheduler.create(input(None)).await.unwrap();
        let members: Vec<ListMember> = (0..4)
            .map(|i| ListMember {
                recipient_id: format!("r{i}"),
                address: Some(format!("+{i}")),
                fields: Default::default(),
            })
            .collect();
        db.insert_recipients(&c.id, &members).unwrap();
        let now = Utc::now();
        for i in 0..4 {
            db.mark_recipient_sent(&c.id, &format!("r{i}"), &format!("m{i}"), now)
                .unwrap();
        }
        assert!(scheduler.record_delivery_event("m0", &DeliveryEvent::Delivered).unwrap());
        assert!(scheduler.record_delivery_event("m1", &DeliveryEvent::Delivered).unwrap());
        assert!(scheduler.record_delivery_event("m1", &DeliveryEvent::Replied).unwrap());
        assert!(matches!(
            scheduler.record_delivery_event("nope", &DeliveryEvent::Read),
            Err(EngageError::NotFound(_))
        ));

        let a = scheduler.analytics(&c.id).unwrap();
        assert_eq!(a.stats.sent, 4);
        assert_eq!(a.stats.delivered, 2);
        assert!((a.reply_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(a.timeline.iter().map(|(_, n)| n).sum::<u64>(), 4);
    }
}
