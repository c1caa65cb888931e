//! Automation management: definition CRUD, direct and event-driven
//! triggering, dry runs, and the execution log.

use std::sync::Arc;

use chrono::Utc;
use engage_core::error::{EngageError, Result};
use engage_core::types::{
    AutomationDefinition, AutomationNode, ExecutionFilter, ExecutionRecord, ExecutionStatus,
    NodeKind, Page, PageRequest, Payload, new_id,
};
use engage_db::EngageDb;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::workflow::{ExecutionReport, WorkflowExecutor};

/// Partial update of a definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub nodes: Option<Vec<AutomationNode>>,
    pub active: Option<bool>,
}

/// One automation started by `trigger_by_event`.
#[derive(Debug)]
pub struct TriggeredAutomation {
    pub automation_id: String,
    pub name: String,
    /// The background run; resolves to `None` if the run errored.
    pub task: JoinHandle<Option<ExecutionReport>>,
}

/// Structured dry-run outcome. Errors are folded in, never raised.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub test_id: String,
    pub status: ExecutionStatus,
    pub triggered: bool,
    pub action_executed: bool,
    pub message: String,
}

pub struct AutomationService {
    db: Arc<EngageDb>,
    executor: Arc<WorkflowExecutor>,
}

impl AutomationService {
    pub fn new(db: Arc<EngageDb>, executor: Arc<WorkflowExecutor>) -> Self {
        Self { db, executor }
    }

    pub async fn create(&self, mut def: AutomationDefinition) -> Result<AutomationDefinition> {
        def.normalize_positions();
        self.validate(&def)?;
        let now = Utc::now();
        def.created_at = now;
        def.updated_at = now;
        def.execution_count = 0;
        def.last_executed_at = None;
        self.db.save_automation(&def)?;
        tracing::info!("🧩 Automation created: '{}' ({})", def.name, def.id);
        Ok(def)
    }

    pub async fn update(&self, id: &str, patch: AutomationPatch) -> Result<AutomationDefinition> {
        let mut def = self.get(id).await?;
        if let Some(name) = patch.name {
            def.name = name;
        }
        if let Some(description) = patch.description {
            def.description = description;
        }
        if let Some(nodes) = patch.nodes {
            def.nodes = nodes;
        }
        if let Some(active) = patch.active {
            def.active = active;
        }
        def.normalize_positions();
        self.validate(&def)?;
        def.updated_at = Utc::now();
        self.db.save_automation(&def)?;
        tracing::info!("🧩 Automation updated: '{}' ({})", def.name, def.id);
        Ok(def)
    }

    /// Delete a definition and its execution log.
    pub async fn delete(&self, id: &str) -> Result<()> {
        if !self.db.delete_automation(id)? {
            return Err(EngageError::not_found("automation", id));
        }
        tracing::info!("🗑️ Automation deleted: {id}");
        Ok(())
    }

    pub async fn toggle(&self, id: &str, active: bool) -> Result<AutomationDefinition> {
        if !self.db.set_automation_active(id, active)? {
            return Err(EngageError::not_found("automation", id));
        }
        tracing::info!(
            "🔀 Automation {id} {}",
            if active { "activated" } else { "deactivated" }
        );
        self.get(id).await
    }

    pub async fn get(&self, id: &str) -> Result<AutomationDefinition> {
        self.db
            .get_automation(id)?
            .ok_or_else(|| EngageError::not_found("automation", id))
    }

    pub async fn list(&self) -> Result<Vec<AutomationDefinition>> {
        self.db.list_automations()
    }

    /// Run one automation now and wait for it.
    pub async fn trigger(&self, id: &str, payload: Payload) -> Result<ExecutionReport> {
        self.executor.execute_automation(id, payload).await
    }

    /// Start every active automation whose trigger predicate accepts the
    /// payload, whatever its trigger service is named. `event` is only
    /// stamped into the payload as its `event` field when it has none, so
    /// predicates keyed on the event name still see it. Each run proceeds
    /// on its own task.
    pub async fn trigger_by_event(
        &self,
        event: &str,
        mut payload: Payload,
    ) -> Result<Vec<TriggeredAutomation>> {
        if let Some(obj) = payload.as_object_mut() {
            obj.entry("event").or_insert_with(|| Payload::String(event.to_string()));
        }

        let mut started = Vec::new();
        for def in self.db.active_automations()? {
            let Some(trigger) = def.trigger_node() else {
                continue;
            };
            match self.executor.triggers().validate(trigger, &payload) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!("⚠️ Trigger check failed for automation {}: {e}", def.id);
                    continue;
                }
            }

            let executor = self.executor.clone();
            let id = def.id.clone();
            let data = payload.clone();
            let task = tokio::spawn(async move {
                match executor.execute_automation(&id, data).await {
                    Ok(report) => Some(report),
                    Err(e) => {
                        tracing::error!("❌ Automation {id} failed: {e}");
                        None
                    }
                }
            });
            tracing::info!("🚀 Event '{event}' triggered automation '{}'", def.name);
            started.push(TriggeredAutomation {
                automation_id: def.id,
                name: def.name,
                task,
            });
        }
        Ok(started)
    }

    /// Dry run against sample data. A missing automation is still an error.
    pub async fn test_automation(&self, id: &str, sample: Payload) -> Result<TestOutcome> {
        self.get(id).await?;
        let test_id = format!("test_{}", new_id());
        let outcome = match self.executor.execute_automation(id, sample).await {
            Ok(report) if report.status == ExecutionStatus::Success => TestOutcome {
                test_id,
                status: ExecutionStatus::Success,
                triggered: true,
                action_executed: !report.results.is_empty(),
                message: "Test completed successfully".into(),
            },
            Ok(report) => TestOutcome {
                test_id,
                status: ExecutionStatus::Failed,
                triggered: false,
                action_executed: false,
                message: report.error_message.unwrap_or_default(),
            },
            Err(e) => TestOutcome {
                test_id,
                status: ExecutionStatus::Failed,
                triggered: false,
                action_executed: false,
                message: e.to_string(),
            },
        };
        Ok(outcome)
    }

    pub async fn execution_logs(
        &self,
        id: &str,
        filter: &ExecutionFilter,
        req: PageRequest,
    ) -> Result<Page<ExecutionRecord>> {
        self.get(id).await?;
        self.db.execution_logs(id, filter, req)
    }

    /// Shape checks plus every trigger/action service must be registered.
    fn validate(&self, def: &AutomationDefinition) -> Result<()> {
        def.validate_shape()?;
        for node in &def.nodes {
            match &node.kind {
                NodeKind::Trigger { service, .. } if !self.executor.triggers().contains(service) => {
                    return Err(EngageError::UnknownTriggerService(service.clone()));
                }
                NodeKind::Action { service, .. } if !self.executor.actions().contains(service) => {
                    return Err(EngageError::UnknownActionService(service.clone()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
