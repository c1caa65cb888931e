//! Follow-up scheduling and recipient selection.

use engage_core::error::Result;
use engage_core::traits::JobQueue;
use engage_core::types::{Campaign, FollowUpCondition, FollowUpRule, RecipientRecord};
use engage_db::EngageDb;
use serde::{Deserialize, Serialize};

use crate::{SEND_FOLLOW_UP, job_key};

/// Payload of a "send-follow-up" job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFollowUpJob {
    pub campaign_id: String,
    pub follow_up_id: String,
}

/// Enqueue one follow-up job per rule, in rule order. Returns how many
/// were queued.
///
/// Queued jobs under the campaign key are dropped first, so running this
/// again for a redelivered send job leaves one job per rule.
pub async fn schedule_follow_ups(queue: &dyn JobQueue, campaign: &Campaign) -> Result<usize> {
    let key = job_key(&campaign.id);
    let dropped = queue.cancel(&key).await?;
    if dropped > 0 {
        tracing::debug!("Dropped {dropped} queued job(s) for '{}' before rescheduling", campaign.name);
    }
    let mut rules: Vec<&FollowUpRule> = campaign.follow_ups.iter().collect();
    rules.sort_by_key(|r| r.order);

    for rule in &rules {
        let job = SendFollowUpJob {
            campaign_id: campaign.id.clone(),
            follow_up_id: rule.id.clone(),
        };
        queue
            .enqueue(
                SEND_FOLLOW_UP,
                serde_json::to_value(&job)?,
                rule.delay_duration(),
                Some(&key),
            )
            .await?;
        tracing::info!(
            "🔁 Follow-up {} for '{}' in {} {}",
            rule.id,
            campaign.name,
            rule.delay,
            rule.delay_unit
        );
    }
    Ok(rules.len())
}

/// Recipients a rule applies to: everyone reached by the initial send,
/// minus those who replied when the rule is `if_no_response`.
pub fn select_recipients(
    db: &EngageDb,
    campaign_id: &str,
    rule: &FollowUpRule,
) -> Result<Vec<RecipientRecord>> {
    let only_unreplied = rule.condition == FollowUpCondition::IfNoResponse;
    db.reached_recipients(campaign_id, only_unreplied)
}
