//! # Engage Channels
//!
//! Outbound channel adapters used by campaign delivery and the
//! `send_template` automation action.
//!
//! | Channel  | Transport                          |
//! |----------|------------------------------------|
//! | whatsapp | Cloud API template messages        |
//! | webhook  | JSON POST to a configured endpoint |

pub mod webhook;
pub mod whatsapp;

use std::sync::Arc;

use engage_core::config::EngageConfig;
use engage_core::traits::{ChannelAdapter, ChannelMap};

pub use webhook::WebhookChannel;
pub use whatsapp::WhatsAppTemplateChannel;

/// Build the channel map from config. Disabled channels are left out;
/// misconfigured ones are logged and left out.
pub fn build_channels(config: &EngageConfig) -> ChannelMap {
    let mut channels = ChannelMap::new();

    if let Some(wa) = config.whatsapp.as_ref().filter(|c| c.enabled) {
        match WhatsAppTemplateChannel::new(wa.clone()) {
            Ok(channel) => register(&mut channels, Arc::new(channel)),
            Err(e) => tracing::warn!("⚠️ WhatsApp channel disabled: {e}"),
        }
    }
    if let Some(hook) = config.webhook.as_ref().filter(|c| c.enabled) {
        match WebhookChannel::new(hook.clone()) {
            Ok(channel) => register(&mut channels, Arc::new(channel)),
            Err(e) => tracing::warn!("⚠️ Webhook channel disabled: {e}"),
        }
    }

    if channels.is_empty() {
        tracing::warn!("⚠️ No outbound channels configured, sends will fail");
    }
    channels
}

fn register(channels: &mut ChannelMap, channel: Arc<dyn ChannelAdapter>) {
    tracing::info!("📡 Channel '{}' ready", channel.name());
    channels.insert(channel.name().to_string(), channel);
}
