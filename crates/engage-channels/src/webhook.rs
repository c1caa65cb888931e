//! Generic HTTP webhook channel: POSTs one JSON document per message and
//! lets the receiving service do the actual delivery.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use engage_core::config::WebhookChannelConfig;
use engage_core::error::{EngageError, Result};
use engage_core::traits::{ChannelAdapter, DeliveryReceipt};
use engage_core::types::new_id;

pub struct WebhookChannel {
    config: WebhookChannelConfig,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookChannelConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(EngageError::Config("webhook url not configured".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngageError::Http(format!("webhook client: {e}")))?;
        Ok(Self { config, client })
    }
}

/// Request body. `message_id` is generated here so the receiver can
/// report status callbacks against it when it does not return its own.
pub fn webhook_body(
    message_id: &str,
    to: &str,
    template_id: &str,
    locale: &str,
    variables: &BTreeMap<String, String>,
) -> serde_json::Value {
    serde_json::json!({
        "message_id": message_id,
        "to": to,
        "template": template_id,
        "locale": locale,
        "variables": variables,
    })
}

#[async_trait]
impl ChannelAdapter for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send_template(
        &self,
        address: &str,
        template_id: &str,
        locale: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<DeliveryReceipt> {
        let message_id = new_id();
        let mut req = self
            .client
            .post(&self.config.url)
            .json(&webhook_body(&message_id, address, template_id, locale, variables));
        for (key, value) in &self.config.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EngageError::ExternalDelivery(format!("Webhook send failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngageError::ExternalDelivery(format!(
                "Webhook error {status}: {body}"
            )));
        }

        // Prefer the receiver's id when it returns one.
        let external_message_id = resp
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v["message_id"].as_str().map(String::from))
            .unwrap_or(message_id);
        tracing::debug!("🌐 Webhook message {external_message_id} → {address}");
        Ok(DeliveryReceipt {
            external_message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_body() {
        let vars = BTreeMap::from([("name".to_string(), "Lan".to_string())]);
        let body = webhook_body("m-1", "lan@example.com", "welcome", "vi", &vars);
        assert_eq!(body["message_id"], "m-1");
        assert_eq!(body["to"], "lan@example.com");
        assert_eq!(body["template"], "welcome");
        assert_eq!(body["variables"]["name"], "Lan");
    }

    #[test]
    fn test_requires_url() {
        let config = WebhookChannelConfig {
            enabled: true,
            url: String::new(),
            headers: vec![],
        };
        assert!(matches!(WebhookChannel::new(config), Err(EngageError::Config(_))));
    }
}
