//! Domain types shared by the store, the workflow engine, and the campaign pipeline.

pub mod automation;
pub mod campaign;
pub mod delay;
pub mod paging;

pub use automation::{
    ActionOutcome, AutomationDefinition, AutomationNode, ExecutionFilter, ExecutionRecord,
    ExecutionStatus, NodeKind,
};
pub use campaign::{
    Campaign, CampaignAnalytics, CampaignInput, CampaignPatch, CampaignStats, CampaignStatus,
    DeliveryEvent, FollowUpCondition, FollowUpRule, ListMember, RecipientRecord,
    RecipientStatus,
};
pub use delay::DelayUnit;
pub use paging::{Page, PageRequest, Pagination};

/// Free-form event / trigger payload.
pub type Payload = serde_json::Value;

/// Generate a new random identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
