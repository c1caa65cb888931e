//! Campaigns, follow-up rules, and per-recipient delivery records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use super::delay::DelayUnit;
use super::new_id;
use crate::error::{EngageError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Failed => "failed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    /// Allowed lifecycle moves. Everything runs forward except two exits:
    /// scheduled → cancelled, and scheduled → draft when the queue refuses
    /// the send job. sending → sending covers a redelivered job.
    pub fn can_become(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Scheduled, Draft)
                | (Scheduled, Scheduled)
                | (Scheduled, Sending)
                | (Scheduled, Cancelled)
                | (Scheduled, Failed)
                | (Sending, Sending)
                | (Sending, Sent)
                | (Sending, Failed)
        )
    }
}

impl FromStr for CampaignStatus {
    type Err = EngageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "sent" => Ok(CampaignStatus::Sent),
            "failed" => Ok(CampaignStatus::Failed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            other => Err(EngageError::Database(format!("unknown campaign status '{other}'"))),
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpCondition {
    IfNoResponse,
    Always,
}

/// Conditional secondary send evaluated after the initial batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpRule {
    #[serde(default = "new_id")]
    pub id: String,
    pub template_id: String,
    pub condition: FollowUpCondition,
    pub delay: u64,
    pub delay_unit: DelayUnit,
    #[serde(default)]
    pub order: u32,
}

impl FollowUpRule {
    pub fn delay_duration(&self) -> std::time::Duration {
        self.delay_unit.duration(self.delay)
    }
}

/// A bulk templated send targeting one list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub list_id: String,
    pub channels: Vec<String>,
    pub template_id: String,
    pub template_variables: BTreeMap<String, String>,
    pub locale: String,
    pub sms_body: Option<String>,
    pub email_subject: Option<String>,
    pub email_body: Option<String>,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub follow_ups: Vec<FollowUpRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn follow_up(&self, rule_id: &str) -> Option<&FollowUpRule> {
        self.follow_ups.iter().find(|f| f.id == rule_id)
    }
}

/// Fields accepted when creating a campaign.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignInput {
    pub name: String,
    pub list_id: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub template_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub sms_body: Option<String>,
    #[serde(default)]
    pub email_subject: Option<String>,
    #[serde(default)]
    pub email_body: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub follow_ups: Vec<FollowUpRule>,
}

impl CampaignInput {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngageError::ValidationFailed("campaign name is required".into()));
        }
        if self.list_id.trim().is_empty() {
            return Err(EngageError::ValidationFailed("target list is required".into()));
        }
        if self.channels.is_empty() {
            return Err(EngageError::ValidationFailed(
                "at least one channel is required".into(),
            ));
        }
        if self.template_id.trim().is_empty() {
            return Err(EngageError::ValidationFailed("template is required".into()));
        }
        if self.channels.iter().any(|c| c == "sms")
            && self.sms_body.as_deref().is_none_or(str::is_empty)
        {
            return Err(EngageError::ValidationFailed(
                "sms body is required when sms is selected".into(),
            ));
        }
        if self.channels.iter().any(|c| c == "email")
            && (self.email_subject.as_deref().is_none_or(str::is_empty)
                || self.email_body.as_deref().is_none_or(str::is_empty))
        {
            return Err(EngageError::ValidationFailed(
                "email subject and body are required when email is selected".into(),
            ));
        }
        validate_follow_ups(&self.follow_ups)
    }

    /// Materialize into a campaign with the given initial status.
    pub fn into_campaign(self, status: CampaignStatus, default_locale: &str) -> Campaign {
        let now = Utc::now();
        let mut follow_ups = self.follow_ups;
        follow_ups.sort_by_key(|f| f.order);
        Campaign {
            id: new_id(),
            name: self.name,
            list_id: self.list_id,
            channels: self.channels,
            template_id: self.template_id,
            template_variables: self.template_variables,
            locale: self.locale.unwrap_or_else(|| default_locale.to_string()),
            sms_body: self.sms_body,
            email_subject: self.email_subject,
            email_body: self.email_body,
            status,
            scheduled_at: self.scheduled_at,
            sent_at: None,
            cancelled_at: None,
            follow_ups,
            created_at: now,
            updated_at: now,
        }
    }
}

pub(crate) fn validate_follow_ups(rules: &[FollowUpRule]) -> Result<()> {
    for rule in rules {
        if rule.template_id.trim().is_empty() {
            return Err(EngageError::ValidationFailed(format!(
                "follow-up '{}' has no template",
                rule.id
            )));
        }
        if rule.delay_unit.checked_duration(rule.delay).is_none() {
            return Err(EngageError::ValidationFailed(format!(
                "follow-up '{}' delay of {} {} is out of range",
                rule.id, rule.delay, rule.delay_unit
            )));
        }
    }
    Ok(())
}

fn required(value: String, what: &str) -> Result<String> {
    if value.trim().is_empty() {
        return Err(EngageError::ValidationFailed(format!("{what} is required")));
    }
    Ok(value)
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub list_id: Option<String>,
    #[serde(default)]
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_variables: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub sms_body: Option<String>,
    #[serde(default)]
    pub email_subject: Option<String>,
    #[serde(default)]
    pub email_body: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub follow_ups: Option<Vec<FollowUpRule>>,
}

impl CampaignPatch {
    pub fn apply(self, campaign: &mut Campaign) -> Result<()> {
        if let Some(name) = self.name {
            campaign.name = required(name, "campaign name")?;
        }
        if let Some(list_id) = self.list_id {
            campaign.list_id = required(list_id, "target list")?;
        }
        if let Some(channels) = self.channels {
            if channels.is_empty() {
                return Err(EngageError::ValidationFailed(
                    "at least one channel is required".into(),
                ));
            }
            campaign.channels = channels;
        }
        if let Some(template_id) = self.template_id {
            campaign.template_id = required(template_id, "template")?;
        }
        if let Some(vars) = self.template_variables {
            campaign.template_variables = vars;
        }
        if let Some(locale) = self.locale {
            campaign.locale = locale;
        }
        if self.sms_body.is_some() {
            campaign.sms_body = self.sms_body;
        }
        if self.email_subject.is_some() {
            campaign.email_subject = self.email_subject;
        }
        if self.email_body.is_some() {
            campaign.email_body = self.email_body;
        }
        if self.scheduled_at.is_some() {
            campaign.scheduled_at = self.scheduled_at;
        }
        if let Some(mut follow_ups) = self.follow_ups {
            validate_follow_ups(&follow_ups)?;
            follow_ups.sort_by_key(|f| f.order);
            campaign.follow_ups = follow_ups;
        }
        campaign.updated_at = Utc::now();
        Ok(())
    }
}

/// A target-list member as returned by the list resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListMember {
    pub recipient_id: String,
    pub address: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl ListMember {
    /// Address to use on `channel`: a channel-specific field wins over
    /// the primary address. Blank values count as missing.
    pub fn address_for(&self, channel: &str) -> Option<&str> {
        let usable = |a: &&str| !a.trim().is_empty();
        self.fields
            .get(channel)
            .map(String::as_str)
            .filter(usable)
            .or(self.address.as_deref().filter(usable))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Delivered => "delivered",
            RecipientStatus::Read => "read",
            RecipientStatus::Failed => "failed",
        }
    }

    /// Reached the recipient's channel at least once.
    pub fn is_reached(&self) -> bool {
        matches!(
            self,
            RecipientStatus::Sent | RecipientStatus::Delivered | RecipientStatus::Read
        )
    }
}

impl FromStr for RecipientStatus {
    type Err = EngageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RecipientStatus::Pending),
            "sent" => Ok(RecipientStatus::Sent),
            "delivered" => Ok(RecipientStatus::Delivered),
            "read" => Ok(RecipientStatus::Read),
            "failed" => Ok(RecipientStatus::Failed),
            other => Err(EngageError::Database(format!("unknown recipient status '{other}'"))),
        }
    }
}

/// Per-recipient status tracker for one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub campaign_id: String,
    pub recipient_id: String,
    pub address: Option<String>,
    pub fields: BTreeMap<String, String>,
    pub status: RecipientStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub external_message_id: Option<String>,
}

impl RecipientRecord {
    /// The list member snapshot taken at fan-out.
    pub fn member(&self) -> ListMember {
        ListMember {
            recipient_id: self.recipient_id.clone(),
            address: self.address.clone(),
            fields: self.fields.clone(),
        }
    }
}

/// Status callback reported by a channel provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeliveryEvent {
    Delivered,
    Read,
    Opened,
    Clicked,
    Replied,
    Failed { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub total: u64,
    pub pending: u64,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub opened: u64,
    pub clicked: u64,
    pub replied: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignAnalytics {
    pub campaign_id: String,
    pub stats: CampaignStats,
    pub open_rate: f64,
    pub click_rate: f64,
    pub reply_rate: f64,
    /// Sends per hour bucket ("%Y-%m-%d %H:00").
    pub timeline: Vec<(String, u64)>,
}

impl CampaignAnalytics {
    pub fn new(campaign_id: &str, stats: CampaignStats, timeline: Vec<(String, u64)>) -> Self {
        let rate = |n: u64| {
            if stats.delivered == 0 {
                0.0
            } else {
                n as f64 / stats.delivered as f64 * 100.0
            }
        };
        Self {
            campaign_id: campaign_id.to_string(),
            open_rate: rate(stats.opened),
            click_rate: rate(stats.clicked),
            reply_rate: rate(stats.replied),
            stats,
            timeline,
        }
    }
}
