//! End-to-end runs through the real SQLite store and job queue with an
//! in-memory channel adapter.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use engage_campaigns::{
    CampaignScheduler, DeliveryWorker, RecipientFanout, SEND_CAMPAIGN, SEND_FOLLOW_UP,
};
use engage_core::error::{EngageError, Result};
use engage_core::traits::{ChannelAdapter, ChannelMap, DeliveryReceipt};
use engage_core::types::{
    AutomationDefinition, AutomationNode, CampaignInput, CampaignStatus, DelayUnit, DeliveryEvent,
    ExecutionStatus, FollowUpCondition, FollowUpRule, ListMember, RecipientStatus,
};
use engage_db::{EngageDb, JobState};
use engage_scheduler::{
    ActionRegistry, AutomationService, SqliteJobQueue, TriggerRegistry, WorkflowExecutor,
};
use serde_json::json;

#[derive(Default)]
struct MemoryChannel {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ChannelAdapter for MemoryChannel {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send_template(
        &self,
        address: &str,
        template_id: &str,
        _locale: &str,
        _variables: &BTreeMap<String, String>,
    ) -> Result<DeliveryReceipt> {
        if address == "+000" {
            return Err(EngageError::ExternalDelivery("invalid number".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((address.to_string(), template_id.to_string()));
        Ok(DeliveryReceipt {
            external_message_id: format!("wamid.{}", sent.len()),
        })
    }
}

struct Stack {
    db: Arc<EngageDb>,
    queue: Arc<SqliteJobQueue>,
    channel: Arc<MemoryChannel>,
    campaigns: CampaignScheduler,
    worker: DeliveryWorker,
    automations: AutomationService,
}

fn stack() -> Stack {
    let db = Arc::new(EngageDb::open_in_memory().unwrap());
    let queue = Arc::new(SqliteJobQueue::new(db.clone(), Default::default()));
    let channel = Arc::new(MemoryChannel::default());
    let mut channels = ChannelMap::new();
    channels.insert("whatsapp".into(), channel.clone());

    let executor = Arc::new(WorkflowExecutor::new(
        db.clone(),
        Arc::new(TriggerRegistry::with_builtins()),
        Arc::new(ActionRegistry::with_builtins(db.clone(), channels.clone())),
    ));
    Stack {
        campaigns: CampaignScheduler::new(db.clone(), queue.clone(), "en"),
        worker: DeliveryWorker::new(
            db.clone(),
            RecipientFanout::new(db.clone(), db.clone()),
            channels,
            queue.clone(),
            Duration::ZERO,
        ),
        automations: AutomationService::new(db.clone(), executor),
        db,
        queue,
        channel,
    }
}

fn add_members(db: &EngageDb, list_id: &str, addresses: &[&str]) {
    for (i, address) in addresses.iter().enumerate() {
        db.add_list_member(
            list_id,
            &ListMember {
                recipient_id: format!("contact-{i}"),
                address: Some(address.to_string()),
                fields: BTreeMap::from([("first_name".to_string(), format!("C{i}"))]),
            },
        )
        .unwrap();
    }
}

fn campaign_input(follow_ups: Vec<FollowUpRule>) -> CampaignInput {
    CampaignInput {
        name: "Black Friday".into(),
        list_id: "vip".into(),
        channels: vec!["whatsapp".into()],
        template_id: "bf_2026".into(),
        template_variables: BTreeMap::from([("1".to_string(), "{{first_name}}".to_string())]),
        scheduled_at: Some(Utc::now() - chrono::Duration::seconds(5)),
        follow_ups,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_campaign_send_then_follow_up() {
    let s = stack();
    add_members(&s.db, "vip", &["+111", "+000", "+333"]);
    let rule = FollowUpRule {
        id: "reminder".into(),
        template_id: "bf_reminder".into(),
        condition: FollowUpCondition::IfNoResponse,
        delay: 0,
        delay_unit: DelayUnit::Hours,
        order: 0,
    };
    let campaign = s.campaigns.create(campaign_input(vec![rule])).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Scheduled);

    assert_eq!(s.queue.run_ready(SEND_CAMPAIGN, &s.worker).await.unwrap(), 1);

    let sent = s.campaigns.get(&campaign.id).unwrap();
    assert_eq!(sent.status, CampaignStatus::Sent);
    let failed = s.db.get_recipient(&campaign.id, "contact-1").unwrap().unwrap();
    assert_eq!(failed.status, RecipientStatus::Failed);
    assert!(failed.failure_reason.is_some());

    // first recipient replies, so only the third gets the reminder
    let first = s.db.get_recipient(&campaign.id, "contact-0").unwrap().unwrap();
    s.campaigns
        .record_delivery_event(first.external_message_id.as_deref().unwrap(), &DeliveryEvent::Replied)
        .unwrap();

    assert_eq!(s.queue.run_ready(SEND_FOLLOW_UP, &s.worker).await.unwrap(), 1);
    let log = s.channel.sent.lock().unwrap().clone();
    assert_eq!(
        log,
        vec![
            ("+111".to_string(), "bf_2026".to_string()),
            ("+333".to_string(), "bf_2026".to_string()),
            ("+333".to_string(), "bf_reminder".to_string()),
        ]
    );
    assert_eq!(s.db.count_jobs(SEND_FOLLOW_UP, JobState::Done).unwrap(), 1);

    let analytics = s.campaigns.analytics(&campaign.id).unwrap();
    assert_eq!(analytics.stats.sent, 2);
    assert_eq!(analytics.stats.failed, 1);
    assert_eq!(analytics.stats.replied, 1);
}

#[tokio::test]
async fn test_cancelled_campaign_never_sends() {
    let s = stack();
    add_members(&s.db, "vip", &["+111"]);
    let mut input = campaign_input(vec![]);
    input.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
    let campaign = s.campaigns.create(input).await.unwrap();

    s.campaigns.cancel(&campaign.id).await.unwrap();
    assert_eq!(s.db.count_jobs(SEND_CAMPAIGN, JobState::Queued).unwrap(), 0);

    // a send job that slipped past the cancel is still a no-op
    assert!(s.worker.send_campaign(&campaign.id).await.unwrap().is_none());
    assert_eq!(s.db.count_recipients(&campaign.id).unwrap(), 0);
    assert!(s.channel.sent.lock().unwrap().is_empty());
    assert_eq!(
        s.campaigns.get(&campaign.id).unwrap().status,
        CampaignStatus::Cancelled
    );
}

#[tokio::test]
async fn test_event_runs_matching_automation() {
    let s = stack();
    let def = s
        .automations
        .create(AutomationDefinition::new(
            "Order confirmation",
            vec![
                AutomationNode::trigger("order_created", json!({"storeId": "S1"})),
                AutomationNode::action(
                    "send_template",
                    json!({"templateId": "order_confirmed", "variables": {"1": "{{event.orderId}}"}}),
                ),
            ],
        ))
        .await
        .unwrap();
    // positions follow the given order after normalization
    assert!(def.nodes.iter().enumerate().all(|(i, n)| n.position == i as u32));

    let runs = s
        .automations
        .trigger_by_event("order_created", json!({"storeId": "S2", "phone": "+555"}))
        .await
        .unwrap();
    assert!(runs.is_empty());

    let runs = s
        .automations
        .trigger_by_event(
            "order_created",
            json!({"storeId": "S1", "orderId": "O1", "phone": "+555"}),
        )
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    let report = runs.into_iter().next().unwrap().task.await.unwrap().unwrap();
    assert_eq!(report.status, ExecutionStatus::Success);
    assert_eq!(
        s.channel.sent.lock().unwrap().as_slice(),
        &[("+555".to_string(), "order_confirmed".to_string())]
    );
}
