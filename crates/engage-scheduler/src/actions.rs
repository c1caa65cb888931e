//! Action registry and built-in action executors.
//!
//! Before an executor runs, `{{event.<field>}}` placeholders in the node's
//! config are replaced with top-level fields of the trigger payload.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engage_core::error::{EngageError, Result};
use engage_core::traits::ChannelMap;
use engage_core::types::{AutomationNode, ListMember, NodeKind, Payload};
use engage_db::EngageDb;
use serde_json::json;

/// Performs one action node. A returned error aborts the rest of the run.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, config: &Payload, payload: &Payload) -> Result<Payload>;
}

#[derive(Clone, Default)]
pub struct ActionRegistry {
    executors: HashMap<String, Arc<dyn ActionExecutor>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `http_request`, `send_template`, `add_to_list`, and `log`.
    pub fn with_builtins(db: Arc<EngageDb>, channels: ChannelMap) -> Self {
        let mut reg = Self::new();
        reg.register("http_request", HttpRequestAction::new());
        reg.register("send_template", SendTemplateAction { channels });
        reg.register("add_to_list", AddToListAction { db });
        reg.register("log", LogAction);
        reg
    }

    pub fn register(&mut self, service: &str, executor: impl ActionExecutor + 'static) {
        self.executors.insert(service.to_string(), Arc::new(executor));
    }

    pub fn contains(&self, service: &str) -> bool {
        self.executors.contains_key(service)
    }

    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run an action node against the trigger payload.
    pub async fn execute(&self, node: &AutomationNode, payload: &Payload) -> Result<Payload> {
        let NodeKind::Action { service, config } = &node.kind else {
            return Err(EngageError::InvalidDefinition(format!(
                "node '{}' is a {} node, not an action",
                node.id,
                node.kind_name()
            )));
        };
        let executor = self
            .executors
            .get(service)
            .ok_or_else(|| EngageError::UnknownActionService(service.clone()))?;
        let config = interpolate(config, payload);
        executor.execute(&config, payload).await
    }
}

/// Replace `{{event.<field>}}` in every string of `config`.
pub fn interpolate(config: &Payload, payload: &Payload) -> Payload {
    match config {
        Payload::String(s) if s.contains("{{event.") => {
            let mut out = s.clone();
            if let Some(fields) = payload.as_object() {
                for (k, v) in fields {
                    let needle = format!("{{{{event.{k}}}}}");
                    if out.contains(&needle) {
                        out = out.replace(&needle, &scalar_text(v));
                    }
                }
            }
            Payload::String(out)
        }
        Payload::Array(items) => {
            Payload::Array(items.iter().map(|v| interpolate(v, payload)).collect())
        }
        Payload::Object(map) => Payload::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate(v, payload)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn scalar_text(v: &Payload) -> String {
    match v {
        Payload::String(s) => s.clone(),
        Payload::Null => String::new(),
        other => other.to_string(),
    }
}

fn str_field<'a>(config: &'a Payload, payload: &'a Payload, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| config.get(*k).and_then(Payload::as_str))
        .or_else(|| keys.iter().find_map(|k| payload.get(*k).and_then(Payload::as_str)))
        .filter(|s| !s.is_empty())
}

// ─── http_request ─────────────────────────────────────────

/// Outbound HTTP call. Transport errors and non-2xx responses are reported
/// in the result rather than failing the run.
pub struct HttpRequestAction {
    client: reqwest::Client,
}

impl HttpRequestAction {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpRequestAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionExecutor for HttpRequestAction {
    async fn execute(&self, config: &Payload, _payload: &Payload) -> Result<Payload> {
        let url = config
            .get("url")
            .and_then(Payload::as_str)
            .ok_or_else(|| EngageError::ValidationFailed("http_request needs a url".into()))?;
        let method = config.get("method").and_then(Payload::as_str).unwrap_or("GET");

        let mut req = match method.to_uppercase().as_str() {
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "PATCH" => self.client.patch(url),
            "DELETE" => self.client.delete(url),
            _ => self.client.get(url),
        };
        if let Some(headers) = config.get("headers").and_then(Payload::as_object) {
            for (k, v) in headers {
                req = req.header(k.as_str(), scalar_text(v));
            }
        }
        if let Some(params) = config.get("params").and_then(Payload::as_object) {
            let pairs: Vec<(String, String)> =
                params.iter().map(|(k, v)| (k.clone(), scalar_text(v))).collect();
            req = req.query(&pairs);
        }
        match config.get("body") {
            Some(Payload::String(raw)) => {
                req = req.header("Content-Type", "application/json").body(raw.clone());
            }
            Some(body) if !body.is_null() => req = req.json(body),
            _ => {}
        }

        tracing::info!("🌐 http_request {method} {url}");
        match req.timeout(Duration::from_secs(30)).send().await {
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                let data = serde_json::from_str(&text).unwrap_or(Payload::String(text));
                Ok(json!({
                    "success": status.is_success(),
                    "status": status.as_u16(),
                    "data": data,
                }))
            }
            Err(e) => {
                tracing::warn!("⚠️ http_request to {url} failed: {e}");
                Ok(json!({
                    "success": false,
                    "status": e.status().map(|s| s.as_u16()),
                    "error": e.to_string(),
                }))
            }
        }
    }
}

// ─── send_template ────────────────────────────────────────

/// Sends a channel template to the payload's contact address.
pub struct SendTemplateAction {
    channels: ChannelMap,
}

#[async_trait]
impl ActionExecutor for SendTemplateAction {
    async fn execute(&self, config: &Payload, payload: &Payload) -> Result<Payload> {
        let channel = config.get("channel").and_then(Payload::as_str).unwrap_or("whatsapp");
        let adapter = self
            .channels
            .get(channel)
            .ok_or_else(|| EngageError::UnknownActionService(format!("channel '{channel}'")))?;
        let template_id = config
            .get("templateId")
            .and_then(Payload::as_str)
            .ok_or_else(|| EngageError::ValidationFailed("send_template needs a templateId".into()))?;
        let address = str_field(config, payload, &["address", "phone"]).ok_or_else(|| {
            EngageError::ValidationFailed("no contact address in trigger payload".into())
        })?;
        let locale = config.get("locale").and_then(Payload::as_str).unwrap_or("en");
        let variables: BTreeMap<String, String> = config
            .get("variables")
            .and_then(Payload::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), scalar_text(v))).collect())
            .unwrap_or_default();

        let receipt = adapter
            .send_template(address, template_id, locale, &variables)
            .await?;
        tracing::info!("📨 Template '{template_id}' sent via {channel} → {address}");
        Ok(json!({
            "sent": true,
            "channel": channel,
            "address": address,
            "externalMessageId": receipt.external_message_id,
        }))
    }
}

// ─── add_to_list ──────────────────────────────────────────

/// Adds the payload's contact to a target list.
pub struct AddToListAction {
    db: Arc<EngageDb>,
}

#[async_trait]
impl ActionExecutor for AddToListAction {
    async fn execute(&self, config: &Payload, payload: &Payload) -> Result<Payload> {
        let list_id = config
            .get("listId")
            .and_then(Payload::as_str)
            .ok_or_else(|| EngageError::ValidationFailed("add_to_list needs a listId".into()))?;
        let recipient_id = str_field(config, payload, &["contactId"]).ok_or_else(|| {
            EngageError::ValidationFailed("no contactId in trigger payload".into())
        })?;
        let fields = payload
            .as_object()
            .map(|m| {
                m.iter()
                    .filter(|(_, v)| v.is_string() || v.is_number())
                    .map(|(k, v)| (k.clone(), scalar_text(v)))
                    .collect()
            })
            .unwrap_or_default();
        let member = ListMember {
            recipient_id: recipient_id.to_string(),
            address: str_field(config, payload, &["address", "phone"]).map(String::from),
            fields,
        };
        self.db.add_list_member(list_id, &member)?;
        tracing::info!("📋 Contact {recipient_id} added to list {list_id}");
        Ok(json!({"added": true, "listId": list_id, "contactId": recipient_id}))
    }
}

// ─── log ──────────────────────────────────────────────────

pub struct LogAction;

#[async_trait]
impl ActionExecutor for LogAction {
    async fn execute(&self, config: &Payload, _payload: &Payload) -> Result<Payload> {
        let message = config.get("message").and_then(Payload::as_str).unwrap_or("");
        tracing::info!("📝 {message}");
        Ok(json!({"logged": true, "message": message}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_core::traits::{ChannelAdapter, DeliveryReceipt};
    use std::sync::Mutex;

    struct FakeChannel {
        sent: Mutex<Vec<(String, String, BTreeMap<String, String>)>>,
    }

    #[async_trait]
    impl ChannelAdapter for FakeChannel {
        fn name(&self) -> &str {
            "whatsapp"
        }

        async fn send_template(
            &self,
            address: &str,
            template_id: &str,
            _locale: &str,
            variables: &BTreeMap<String, String>,
        ) -> Result<DeliveryReceipt> {
            if address == "+000" {
                return Err(EngageError::ExternalDelivery("invalid number".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((address.into(), template_id.into(), variables.clone()));
            Ok(DeliveryReceipt { external_message_id: "wamid.1".into() })
        }
    }

    fn registry() -> (ActionRegistry, Arc<EngageDb>, Arc<FakeChannel>) {
        let db = Arc::new(EngageDb::open_in_memory().unwrap());
        let channel = Arc::new(FakeChannel { sent: Mutex::new(Vec::new()) });
        let mut channels = ChannelMap::new();
        channels.insert("whatsapp".into(), channel.clone());
        (ActionRegistry::with_builtins(db.clone(), channels), db, channel)
    }

    #[test]
    fn test_interpolate_nested() {
        let cfg = json!({"message": "Order {{event.orderId}} for {{event.storeId}}", "n": [ "{{event.total}}" ]});
        let out = interpolate(&cfg, &json!({"orderId": "O1", "storeId": "S1", "total": 42}));
        assert_eq!(out["message"], "Order O1 for S1");
        assert_eq!(out["n"][0], "42");
    }

    #[tokio::test]
    async fn test_send_template_action() {
        let (reg, _db, channel) = registry();
        let node = AutomationNode::action(
            "send_template",
            json!({"templateId": "order_confirm", "variables": {"1": "{{event.orderId}}"}}),
        );
        let result = reg
            .execute(&node, &json!({"phone": "+84901", "orderId": "O1"}))
            .await
            .unwrap();
        assert_eq!(result["externalMessageId"], "wamid.1");
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent[0].0, "+84901");
        assert_eq!(sent[0].2.get("1").unwrap(), "O1");
    }

    #[tokio::test]
    async fn test_send_template_failure_is_error() {
        let (reg, _db, _) = registry();
        let node = AutomationNode::action("send_template", json!({"templateId": "t"}));
        let err = reg.execute(&node, &json!({"phone": "+000"})).await.unwrap_err();
        assert_eq!(err.code(), "EXTERNAL_DELIVERY_ERROR");
    }

    #[tokio::test]
    async fn test_add_to_list_action() {
        let (reg, db, _) = registry();
        let node = AutomationNode::action("add_to_list", json!({"listId": "buyers"}));
        reg.execute(&node, &json!({"contactId": "c9", "phone": "+1", "name": "Mai"}))
            .await
            .unwrap();
        let members = db.list_members("buyers").unwrap();
        assert_eq!(members[0].recipient_id, "c9");
        assert_eq!(members[0].fields.get("name").unwrap(), "Mai");
    }

    #[tokio::test]
    async fn test_unknown_action_service() {
        let reg = ActionRegistry::new();
        let node = AutomationNode::action("teleport", json!({}));
        assert!(matches!(
            reg.execute(&node, &json!({})).await,
            Err(EngageError::UnknownActionService(_))
        ));
    }
}
