//! WhatsApp Business Cloud API template sender.
//!
//! Marketing messages outside the 24h window must be approved templates.
//! Requires: Access Token + Phone Number ID from Meta Business Suite.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use engage_core::config::WhatsAppChannelConfig;
use engage_core::error::{EngageError, Result};
use engage_core::traits::{ChannelAdapter, DeliveryReceipt};

const GRAPH_BASE: &str = "https://graph.facebook.com";

pub struct WhatsAppTemplateChannel {
    config: WhatsAppChannelConfig,
    client: reqwest::Client,
}

impl WhatsAppTemplateChannel {
    pub fn new(config: WhatsAppChannelConfig) -> Result<Self> {
        if config.access_token.is_empty() {
            return Err(EngageError::Config(
                "WhatsApp access_token not configured".into(),
            ));
        }
        if config.phone_number_id.is_empty() {
            return Err(EngageError::Config(
                "WhatsApp phone_number_id not configured".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngageError::Http(format!("WhatsApp client: {e}")))?;
        Ok(Self { config, client })
    }

    fn messages_url(&self) -> String {
        format!(
            "{GRAPH_BASE}/{}/{}/messages",
            self.config.api_version, self.config.phone_number_id
        )
    }
}

/// Build the Cloud API template message body.
///
/// Variables keyed "1", "2", ... become positional body parameters in
/// numeric order; other keys are sent as named parameters.
pub fn template_body(
    to: &str,
    template_id: &str,
    locale: &str,
    variables: &BTreeMap<String, String>,
) -> serde_json::Value {
    let mut positional: Vec<(u32, &String)> = Vec::new();
    let mut named: Vec<(&String, &String)> = Vec::new();
    for (key, value) in variables {
        match key.parse::<u32>() {
            Ok(n) => positional.push((n, value)),
            Err(_) => named.push((key, value)),
        }
    }
    positional.sort_by_key(|(n, _)| *n);

    let mut parameters: Vec<serde_json::Value> = positional
        .into_iter()
        .map(|(_, text)| serde_json::json!({"type": "text", "text": text}))
        .collect();
    parameters.extend(named.into_iter().map(|(name, text)| {
        serde_json::json!({"type": "text", "parameter_name": name, "text": text})
    }));

    let mut template = serde_json::json!({
        "name": template_id,
        "language": { "code": locale },
    });
    if !parameters.is_empty() {
        template["components"] = serde_json::json!([
            { "type": "body", "parameters": parameters }
        ]);
    }

    serde_json::json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "template",
        "template": template,
    })
}

#[async_trait]
impl ChannelAdapter for WhatsAppTemplateChannel {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send_template(
        &self,
        address: &str,
        template_id: &str,
        locale: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<DeliveryReceipt> {
        let body = template_body(address, template_id, locale, variables);
        let response = self
            .client
            .post(self.messages_url())
            .header("Authorization", format!("Bearer {}", self.config.access_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngageError::ExternalDelivery(format!("WhatsApp request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(EngageError::ExternalDelivery(format!(
                "WhatsApp API error {status}: {error_text}"
            )));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngageError::ExternalDelivery(format!("Invalid WhatsApp response: {e}")))?;
        let message_id = result["messages"][0]["id"]
            .as_str()
            .ok_or_else(|| {
                EngageError::ExternalDelivery("WhatsApp response carried no message id".into())
            })?
            .to_string();

        tracing::debug!("WhatsApp template {template_id} sent: {message_id} → {address}");
        Ok(DeliveryReceipt {
            external_message_id: message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WhatsAppChannelConfig {
        WhatsAppChannelConfig {
            enabled: true,
            access_token: "tok".into(),
            phone_number_id: "1055".into(),
            api_version: "v21.0".into(),
        }
    }

    #[test]
    fn test_template_body_orders_parameters() {
        let vars = BTreeMap::from([
            ("10".to_string(), "ten".to_string()),
            ("2".to_string(), "two".to_string()),
            ("1".to_string(), "one".to_string()),
            ("coupon".to_string(), "SAVE10".to_string()),
        ]);
        let body = template_body("+84900000000", "spring_sale", "vi", &vars);
        assert_eq!(body["type"], "template");
        assert_eq!(body["template"]["name"], "spring_sale");
        assert_eq!(body["template"]["language"]["code"], "vi");

        let params = body["template"]["components"][0]["parameters"]
            .as_array()
            .unwrap();
        let texts: Vec<&str> = params.iter().map(|p| p["text"].as_str().unwrap()).collect();
        assert_eq!(texts, vec!["one", "two", "ten", "SAVE10"]);
        assert_eq!(params[3]["parameter_name"], "coupon");
    }

    #[test]
    fn test_template_without_variables_has_no_components() {
        let body = template_body("+1", "hello_world", "en", &BTreeMap::new());
        assert!(body["template"].get("components").is_none());
    }

    #[test]
    fn test_requires_credentials() {
        let mut missing = config();
        missing.access_token.clear();
        assert!(matches!(
            WhatsAppTemplateChannel::new(missing),
            Err(EngageError::Config(_))
        ));

        let channel = WhatsAppTemplateChannel::new(config()).unwrap();
        assert_eq!(
            channel.messages_url(),
            "https://graph.facebook.com/v21.0/1055/messages"
        );
    }
}
