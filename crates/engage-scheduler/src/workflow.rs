//! Workflow executor: runs one automation against one event payload.
//!
//! ```text
//! load definition ── missing/inactive ──▶ error (no record)
//!   └─ insert pending record
//!        └─ validate trigger ── false ──▶ record failed
//!             └─ delay / action nodes in position order
//!                  ├─ all done ──▶ record success, bump counters
//!                  └─ error ─────▶ record failed, error returned
//! ```

use std::sync::Arc;

use chrono::Utc;
use engage_core::error::{EngageError, Result};
use engage_core::types::{
    ActionOutcome, AutomationDefinition, ExecutionRecord, ExecutionStatus, NodeKind, Payload,
};
use engage_db::EngageDb;
use serde::Serialize;

use crate::actions::ActionRegistry;
use crate::triggers::TriggerRegistry;

pub const TRIGGER_REJECTED: &str = "trigger validation failed";

/// Outcome of one run as seen by the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub results: Vec<ActionOutcome>,
    pub error_message: Option<String>,
}

pub struct WorkflowExecutor {
    db: Arc<EngageDb>,
    triggers: Arc<TriggerRegistry>,
    actions: Arc<ActionRegistry>,
}

impl WorkflowExecutor {
    pub fn new(db: Arc<EngageDb>, triggers: Arc<TriggerRegistry>, actions: Arc<ActionRegistry>) -> Self {
        Self { db, triggers, actions }
    }

    pub fn triggers(&self) -> &TriggerRegistry {
        &self.triggers
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub async fn execute_automation(
        &self,
        automation_id: &str,
        payload: Payload,
    ) -> Result<ExecutionReport> {
        let def = self
            .db
            .get_automation(automation_id)?
            .ok_or_else(|| EngageError::not_found("automation", automation_id))?;
        if !def.active {
            return Err(EngageError::Inactive(format!("automation '{automation_id}'")));
        }

        let record = ExecutionRecord::pending(automation_id, payload.clone());
        self.db.insert_execution(&record)?;
        tracing::info!("⚡ Automation '{}' started (execution {})", def.name, record.id);

        let mut results = Vec::new();
        match self.run_nodes(&def, &record.id, &payload, &mut results).await {
            Ok(true) => {
                let now = Utc::now();
                self.db
                    .finish_execution(&record.id, ExecutionStatus::Success, &results, None, now)?;
                self.db.record_automation_run(automation_id, now)?;
                tracing::info!(
                    "✅ Automation '{}' completed ({} action(s))",
                    def.name,
                    results.len()
                );
                Ok(ExecutionReport {
                    execution_id: record.id,
                    status: ExecutionStatus::Success,
                    results,
                    error_message: None,
                })
            }
            Ok(false) => {
                self.db.finish_execution(
                    &record.id,
                    ExecutionStatus::Failed,
                    &results,
                    Some(TRIGGER_REJECTED),
                    Utc::now(),
                )?;
                tracing::info!("⏭️ Automation '{}': {TRIGGER_REJECTED}", def.name);
                Ok(ExecutionReport {
                    execution_id: record.id,
                    status: ExecutionStatus::Failed,
                    results,
                    error_message: Some(TRIGGER_REJECTED.into()),
                })
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(db_err) = self.db.finish_execution(
                    &record.id,
                    ExecutionStatus::Failed,
                    &results,
                    Some(&message),
                    Utc::now(),
                ) {
                    tracing::error!("❌ Could not record failure of {}: {db_err}", record.id);
                }
                tracing::warn!("⚠️ Automation '{}' failed: {message}", def.name);
                Err(e)
            }
        }
    }

    /// Returns `Ok(false)` when the trigger rejects the payload.
    async fn run_nodes(
        &self,
        def: &AutomationDefinition,
        execution_id: &str,
        payload: &Payload,
        results: &mut Vec<ActionOutcome>,
    ) -> Result<bool> {
        let nodes = def.sorted_nodes();
        let trigger = nodes
            .iter()
            .find(|n| n.is_trigger())
            .ok_or_else(|| EngageError::InvalidDefinition("no trigger node found".into()))?;
        if !self.triggers.validate(trigger, payload)? {
            return Ok(false);
        }

        for node in nodes {
            match &node.kind {
                NodeKind::Trigger { .. } => {}
                NodeKind::Delay { amount, unit } => {
                    let wait = unit.duration(*amount);
                    tracing::debug!("💤 Execution {execution_id} waiting {amount} {unit}");
                    tokio::time::sleep(wait).await;
                }
                NodeKind::Action { service, .. } => {
                    let result = self.actions.execute(node, payload).await?;
                    results.push(ActionOutcome {
                        node_id: node.id.clone(),
                        service: service.clone(),
                        result,
                    });
                    self.db.set_execution_results(execution_id, results)?;
                }
            }
        }
        Ok(true)
    }
}
