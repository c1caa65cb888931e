//! Automation definitions and execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::delay::DelayUnit;
use super::{Payload, new_id};
use crate::error::{EngageError, Result};

/// A stored workflow: one trigger followed by delays and actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationDefinition {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<AutomationNode>,
    #[serde(default = "bool_true")]
    pub active: bool,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn bool_true() -> bool {
    true
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationNode {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub position: u32,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Kind-specific node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Trigger {
        service: String,
        #[serde(default)]
        config: Payload,
    },
    Delay {
        amount: u64,
        unit: DelayUnit,
    },
    Action {
        service: String,
        #[serde(default)]
        config: Payload,
    },
}

impl AutomationNode {
    pub fn trigger(service: &str, config: Payload) -> Self {
        Self {
            id: new_id(),
            position: 0,
            kind: NodeKind::Trigger {
                service: service.to_string(),
                config,
            },
        }
    }

    pub fn delay(amount: u64, unit: DelayUnit) -> Self {
        Self {
            id: new_id(),
            position: 0,
            kind: NodeKind::Delay { amount, unit },
        }
    }

    pub fn action(service: &str, config: Payload) -> Self {
        Self {
            id: new_id(),
            position: 0,
            kind: NodeKind::Action {
                service: service.to_string(),
                config,
            },
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self.kind, NodeKind::Trigger { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Trigger { .. } => "trigger",
            NodeKind::Delay { .. } => "delay",
            NodeKind::Action { .. } => "action",
        }
    }
}

impl AutomationDefinition {
    /// Create an active definition; nodes keep the given order.
    pub fn new(name: &str, nodes: Vec<AutomationNode>) -> Self {
        let now = Utc::now();
        let mut def = Self {
            id: new_id(),
            name: name.to_string(),
            description: String::new(),
            nodes: nodes
                .into_iter()
                .enumerate()
                .map(|(i, mut n)| {
                    n.position = i as u32;
                    n
                })
                .collect(),
            active: true,
            execution_count: 0,
            last_executed_at: None,
            created_at: now,
            updated_at: now,
        };
        def.normalize_positions();
        def
    }

    /// Stable-sort nodes by position and renumber them 0..n-1.
    pub fn normalize_positions(&mut self) {
        self.nodes.sort_by_key(|n| n.position);
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.position = i as u32;
        }
    }

    /// Nodes in execution order without mutating the definition.
    pub fn sorted_nodes(&self) -> Vec<&AutomationNode> {
        let mut nodes: Vec<&AutomationNode> = self.nodes.iter().collect();
        nodes.sort_by_key(|n| n.position);
        nodes
    }

    pub fn trigger_node(&self) -> Option<&AutomationNode> {
        self.sorted_nodes().into_iter().find(|n| n.is_trigger())
    }

    /// Structural checks: a name, exactly one trigger at position 0,
    /// dense positions, delay nodes no longer than ten years.
    pub fn validate_shape(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngageError::InvalidDefinition("name is required".into()));
        }
        let triggers = self.nodes.iter().filter(|n| n.is_trigger()).count();
        if triggers != 1 {
            return Err(EngageError::InvalidDefinition(format!(
                "expected exactly one trigger node, found {triggers}"
            )));
        }
        let sorted = self.sorted_nodes();
        for (i, node) in sorted.iter().enumerate() {
            if node.position != i as u32 {
                return Err(EngageError::InvalidDefinition(format!(
                    "node '{}' has position {} but should be {i}",
                    node.id, node.position
                )));
            }
        }
        if !sorted[0].is_trigger() {
            return Err(EngageError::InvalidDefinition(
                "trigger node must be at position 0".into(),
            ));
        }
        for node in &sorted {
            if let NodeKind::Delay { amount, unit } = &node.kind {
                if unit.checked_duration(*amount).is_none() {
                    return Err(EngageError::InvalidDefinition(format!(
                        "delay node '{}' of {amount} {unit} is out of range",
                        node.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = EngageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(EngageError::Database(format!("unknown execution status '{other}'"))),
        }
    }
}

/// Result of one executed action node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub node_id: String,
    pub service: String,
    pub result: Payload,
}

/// Audit row for one run of an automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub automation_id: String,
    pub status: ExecutionStatus,
    pub trigger_payload: Payload,
    pub action_results: Vec<ActionOutcome>,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn pending(automation_id: &str, payload: Payload) -> Self {
        Self {
            id: new_id(),
            automation_id: automation_id.to_string(),
            status: ExecutionStatus::Pending,
            trigger_payload: payload,
            action_results: Vec::new(),
            error_message: None,
            executed_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn last_action_result(&self) -> Option<&Payload> {
        self.action_results.last().map(|o| &o.result)
    }
}

/// Filter for execution-log queries. Bounds are inclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}
