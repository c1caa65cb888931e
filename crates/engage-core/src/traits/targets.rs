use async_trait::async_trait;

use crate::error::Result;
use crate::types::ListMember;

/// Resolves a target list to its current members.
#[async_trait]
pub trait TargetListResolver: Send + Sync {
    async fn resolve(&self, list_id: &str) -> Result<Vec<ListMember>>;
}
