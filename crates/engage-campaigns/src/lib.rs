//! # Engage Campaigns
//!
//! Scheduled bulk messaging with follow-ups.
//!
//! ## Architecture
//! ```text
//! CampaignScheduler.create / start
//!   → campaign row (draft | scheduled)
//!   → JobQueue "send-campaign" (delay = scheduled_at - now, key campaign:<id>)
//!
//! DeliveryWorker (JobHandler)
//!   ├── send-campaign
//!   │   → re-check status (scheduled | sending)
//!   │   → RecipientFanout: list members → pending records (idempotent)
//!   │   → for each pending record: render variables → ChannelAdapter → sent | failed
//!   │   → pause send_interval between sends
//!   │   → status sent → JobQueue "send-follow-up" per rule
//!   └── send-follow-up
//!       → reached recipients (minus repliers for if_no_response)
//!       → same dispatch with the rule's template
//! ```

pub mod delivery;
pub mod fanout;
pub mod followup;
pub mod render;
pub mod scheduler;

pub use delivery::{BatchSummary, DeliveryWorker, SendCampaignJob};
pub use fanout::{FanoutSummary, RecipientFanout};
pub use followup::SendFollowUpJob;
pub use scheduler::CampaignScheduler;

/// Queue topic for the initial campaign send.
pub const SEND_CAMPAIGN: &str = "send-campaign";
/// Queue topic for follow-up sends.
pub const SEND_FOLLOW_UP: &str = "send-follow-up";

/// Queue key shared by every job of one campaign, used for cancellation.
pub fn job_key(campaign_id: &str) -> String {
    format!("campaign:{campaign_id}")
}
