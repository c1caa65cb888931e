//! Trigger registry: service name → predicate over (node config, event payload).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use engage_core::error::{EngageError, Result};
use engage_core::types::{AutomationNode, NodeKind, Payload};

/// Decides whether an event payload satisfies a trigger node's config.
pub trait TriggerPredicate: Send + Sync {
    fn matches(&self, config: &Payload, payload: &Payload) -> bool;
}

impl<F> TriggerPredicate for F
where
    F: Fn(&Payload, &Payload) -> bool + Send + Sync,
{
    fn matches(&self, config: &Payload, payload: &Payload) -> bool {
        self(config, payload)
    }
}

#[derive(Clone, Default)]
pub struct TriggerRegistry {
    predicates: HashMap<String, Arc<dyn TriggerPredicate>>,
}

impl TriggerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in trigger services.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register("order_created", field_equality);
        reg.register("shopify_order", field_equality);
        reg.register("facebook_lead", facebook_lead);
        reg.register("cart_abandoned", cart_abandoned);
        reg.register("webhook", webhook_id);
        reg.register("contact_created", event_named("contact_created"));
        reg.register("contact_deleted", event_named("contact_deleted"));
        reg.register("contact_moved", contact_moved);
        reg.register("mass_sending", mass_sending);
        reg
    }

    /// Add or replace a predicate.
    pub fn register(&mut self, service: &str, predicate: impl TriggerPredicate + 'static) {
        self.predicates.insert(service.to_string(), Arc::new(predicate));
    }

    pub fn contains(&self, service: &str) -> bool {
        self.predicates.contains_key(service)
    }

    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.predicates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Evaluate a trigger node against `payload`.
    pub fn validate(&self, node: &AutomationNode, payload: &Payload) -> Result<bool> {
        let NodeKind::Trigger { service, config } = &node.kind else {
            return Err(EngageError::InvalidDefinition(format!(
                "node '{}' is a {} node, not a trigger",
                node.id,
                node.kind_name()
            )));
        };
        let predicate = self
            .predicates
            .get(service)
            .ok_or_else(|| EngageError::UnknownTriggerService(service.clone()))?;
        Ok(predicate.matches(config, payload))
    }
}

/// Every key configured on the trigger must equal the payload's value.
fn field_equality(config: &Payload, payload: &Payload) -> bool {
    match config.as_object() {
        Some(expected) => expected.iter().all(|(k, v)| payload.get(k) == Some(v)),
        None => true,
    }
}

fn facebook_lead(config: &Payload, payload: &Payload) -> bool {
    ["pageId", "formId"]
        .iter()
        .all(|k| config.get(*k) == payload.get(*k))
}

/// Fires once the cart has been abandoned for at least `timeThreshold` minutes.
fn cart_abandoned(config: &Payload, payload: &Payload) -> bool {
    let Some(abandoned_at) = payload.get("abandonedAt").and_then(parse_instant) else {
        return false;
    };
    let threshold = config
        .get("timeThreshold")
        .and_then(Payload::as_f64)
        .unwrap_or(0.0);
    let minutes = (Utc::now() - abandoned_at).num_milliseconds() as f64 / 60_000.0;
    minutes >= threshold
}

/// Epoch milliseconds or an RFC 3339 string.
fn parse_instant(value: &Payload) -> Option<DateTime<Utc>> {
    if let Some(ms) = value.as_i64() {
        return DateTime::from_timestamp_millis(ms);
    }
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn webhook_id(config: &Payload, payload: &Payload) -> bool {
    match (config.get("webhookId"), payload.get("webhookId")) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => false,
    }
}

fn event_is(payload: &Payload, name: &str) -> bool {
    payload.get("event").and_then(Payload::as_str) == Some(name)
}

fn event_named(name: &'static str) -> impl Fn(&Payload, &Payload) -> bool + Send + Sync {
    move |_config, payload| event_is(payload, name)
}

/// Optionally narrowed to moves into one list.
fn contact_moved(config: &Payload, payload: &Payload) -> bool {
    if !event_is(payload, "contact_moved") {
        return false;
    }
    match config.get("listId").and_then(Payload::as_str) {
        Some(list) if !list.is_empty() => {
            payload.get("listId").and_then(Payload::as_str) == Some(list)
        }
        _ => true,
    }
}

fn mass_sending(_config: &Payload, payload: &Payload) -> bool {
    event_is(payload, "mass_sending")
        && matches!(
            payload.get("source").and_then(Payload::as_str),
            Some("csv") | Some("list")
        )
}
