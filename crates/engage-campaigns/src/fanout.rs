//! Expands a campaign's target list into per-recipient delivery records.

use std::sync::Arc;

use engage_core::error::Result;
use engage_core::traits::TargetListResolver;
use engage_core::types::Campaign;
use engage_db::EngageDb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutSummary {
    /// Members returned by the resolver.
    pub members: usize,
    /// Records created by this call; zero on a repeated fan-out.
    pub created: usize,
}

pub struct RecipientFanout {
    db: Arc<EngageDb>,
    resolver: Arc<dyn TargetListResolver>,
}

impl RecipientFanout {
    pub fn new(db: Arc<EngageDb>, resolver: Arc<dyn TargetListResolver>) -> Self {
        Self { db, resolver }
    }

    /// Create one pending record per list member. Safe to repeat: records
    /// are unique per (campaign, recipient).
    pub async fn expand(&self, campaign: &Campaign) -> Result<FanoutSummary> {
        let members = self.resolver.resolve(&campaign.list_id).await?;
        let created = self.db.insert_recipients(&campaign.id, &members)?;
        tracing::info!(
            "👥 Campaign '{}': {} member(s) in list {}, {} new record(s)",
            campaign.name,
            members.len(),
            campaign.list_id,
            created
        );
        Ok(FanoutSummary {
            members: members.len(),
            created,
        })
    }
}
