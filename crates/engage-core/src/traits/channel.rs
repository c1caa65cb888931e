//! Channel adapter trait: delivers one templated message to one address.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::Result;

/// Provider acknowledgement of an accepted send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub external_message_id: String,
}

/// An outbound messaging channel (WhatsApp, webhook bridge, ...).
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name used in campaign `channels` lists.
    fn name(&self) -> &str;

    /// Send `template_id` rendered with `variables` to `address`.
    /// Provider rejections surface as `EngageError::ExternalDelivery`.
    async fn send_template(
        &self,
        address: &str,
        template_id: &str,
        locale: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<DeliveryReceipt>;
}

/// Adapters keyed by channel name.
pub type ChannelMap = HashMap<String, Arc<dyn ChannelAdapter>>;
