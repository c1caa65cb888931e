//! Automation definitions and their execution log.

use chrono::{DateTime, Utc};
use engage_core::error::{EngageError, Result};
use engage_core::types::{
    ActionOutcome, AutomationDefinition, ExecutionFilter, ExecutionRecord, ExecutionStatus, Page,
    PageRequest, Pagination,
};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use crate::{EngageDb, conversion, db_err, parse_json, parse_opt_ts, parse_ts, ts};

const AUTOMATION_COLUMNS: &str = "id, name, description, nodes_json, active, execution_count, \
     last_executed_at, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, automation_id, status, trigger_payload, action_results, \
     error_message, executed_at, finished_at";

fn automation_from_row(row: &Row<'_>) -> rusqlite::Result<AutomationDefinition> {
    let nodes_json: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(AutomationDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        nodes: parse_json(3, &nodes_json)?,
        active: row.get::<_, i64>(4)? != 0,
        execution_count: row.get::<_, i64>(5)? as u64,
        last_executed_at: parse_opt_ts(6, row.get(6)?)?,
        created_at: parse_ts(7, &created_at)?,
        updated_at: parse_ts(8, &updated_at)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let status: String = row.get(2)?;
    let payload: String = row.get(3)?;
    let results: String = row.get(4)?;
    let executed_at: String = row.get(6)?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        automation_id: row.get(1)?,
        status: status.parse().map_err(|e| conversion(2, e))?,
        trigger_payload: parse_json(3, &payload)?,
        action_results: parse_json(4, &results)?,
        error_message: row.get(5)?,
        executed_at: parse_ts(6, &executed_at)?,
        finished_at: parse_opt_ts(7, row.get(7)?)?,
    })
}

impl EngageDb {
    // ─── Automations ──────────────────────────────────────────

    /// Insert or replace a definition.
    pub fn save_automation(&self, def: &AutomationDefinition) -> Result<()> {
        let nodes = serde_json::to_string(&def.nodes)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO automations
                 (id, name, description, nodes_json, active, execution_count,
                  last_executed_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    def.id,
                    def.name,
                    def.description,
                    nodes,
                    def.active as i32,
                    def.execution_count as i64,
                    def.last_executed_at.as_ref().map(ts),
                    ts(&def.created_at),
                    ts(&def.updated_at),
                ],
            )
            .map_err(db_err("Save automation"))?;
        Ok(())
    }

    pub fn get_automation(&self, id: &str) -> Result<Option<AutomationDefinition>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {AUTOMATION_COLUMNS} FROM automations WHERE id = ?1"),
            params![id],
            automation_from_row,
        )
        .optional()
        .map_err(db_err("Load automation"))
    }

    /// All definitions, oldest first.
    pub fn list_automations(&self) -> Result<Vec<AutomationDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {AUTOMATION_COLUMNS} FROM automations ORDER BY created_at, id"
            ))
            .map_err(db_err("List automations"))?;
        let rows = stmt
            .query_map([], automation_from_row)
            .map_err(db_err("List automations"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List automations"))
    }

    /// Every active definition, in listing order.
    pub fn active_automations(&self) -> Result<Vec<AutomationDefinition>> {
        Ok(self
            .list_automations()?
            .into_iter()
            .filter(|def| def.active)
            .collect())
    }

    /// Delete a definition together with its execution log.
    pub fn delete_automation(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Delete automation"))?;
        tx.execute("DELETE FROM executions WHERE automation_id = ?1", params![id])
            .map_err(db_err("Delete executions"))?;
        let removed = tx
            .execute("DELETE FROM automations WHERE id = ?1", params![id])
            .map_err(db_err("Delete automation"))?;
        tx.commit().map_err(db_err("Delete automation"))?;
        Ok(removed > 0)
    }

    pub fn set_automation_active(&self, id: &str, active: bool) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE automations SET active = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, active as i32, ts(&Utc::now())],
            )
            .map_err(db_err("Toggle automation"))?;
        Ok(changed > 0)
    }

    /// Bump the run counter and stamp the last run time.
    pub fn record_automation_run(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE automations
                 SET execution_count = execution_count + 1, last_executed_at = ?2
                 WHERE id = ?1",
                params![id, ts(&at)],
            )
            .map_err(db_err("Record automation run"))?;
        Ok(())
    }

    // ─── Execution log ────────────────────────────────────────

    pub fn insert_execution(&self, rec: &ExecutionRecord) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO executions
                 (id, automation_id, status, trigger_payload, action_results,
                  error_message, executed_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    rec.id,
                    rec.automation_id,
                    rec.status.as_str(),
                    rec.trigger_payload.to_string(),
                    serde_json::to_string(&rec.action_results)?,
                    rec.error_message,
                    ts(&rec.executed_at),
                    rec.finished_at.as_ref().map(ts),
                ],
            )
            .map_err(db_err("Insert execution"))?;
        Ok(())
    }

    /// Store intermediate action results while the run is still pending.
    pub fn set_execution_results(&self, id: &str, results: &[ActionOutcome]) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE executions SET action_results = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, serde_json::to_string(results)?],
            )
            .map_err(db_err("Update execution results"))?;
        Ok(())
    }

    /// Finalize a pending record. Returns false if it was already final.
    pub fn finish_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        results: &[ActionOutcome],
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if status == ExecutionStatus::Pending {
            return Err(EngageError::InvalidState(
                "an execution cannot be finalized as pending".into(),
            ));
        }
        let changed = self
            .conn()?
            .execute(
                "UPDATE executions
                 SET status = ?2, action_results = ?3, error_message = ?4, finished_at = ?5
                 WHERE id = ?1 AND status = 'pending'",
                params![
                    id,
                    status.as_str(),
                    serde_json::to_string(results)?,
                    error_message,
                    ts(&at),
                ],
            )
            .map_err(db_err("Finish execution"))?;
        Ok(changed > 0)
    }

    pub fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
            params![id],
            execution_from_row,
        )
        .optional()
        .map_err(db_err("Load execution"))
    }

    pub fn count_executions(&self, automation_id: &str) -> Result<u64> {
        let n: i64 = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM executions WHERE automation_id = ?1",
                params![automation_id],
                |r| r.get(0),
            )
            .map_err(db_err("Count executions"))?;
        Ok(n as u64)
    }

    /// Filtered, newest-first page of an automation's execution log.
    pub fn execution_logs(
        &self,
        automation_id: &str,
        filter: &ExecutionFilter,
        req: PageRequest,
    ) -> Result<Page<ExecutionRecord>> {
        let mut clause = String::from("automation_id = ?");
        let mut args: Vec<Value> = vec![Value::Text(automation_id.to_string())];
        if let Some(status) = filter.status {
            clause.push_str(" AND status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(from) = &filter.from {
            clause.push_str(" AND executed_at >= ?");
            args.push(Value::Text(ts(from)));
        }
        if let Some(to) = &filter.to {
            clause.push_str(" AND executed_at <= ?");
            args.push(Value::Text(ts(to)));
        }

        let conn = self.conn()?;
        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM executions WHERE {clause}"),
                params_from_iter(args.iter()),
                |r| r.get(0),
            )
            .map_err(db_err("Count execution logs"))?;

        args.push(Value::Integer(req.limit as i64));
        args.push(Value::Integer(req.offset() as i64));
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions WHERE {clause}
                 ORDER BY executed_at DESC, rowid DESC LIMIT ? OFFSET ?"
            ))
            .map_err(db_err("Query execution logs"))?;
        let items = stmt
            .query_map(params_from_iter(args.iter()), execution_from_row)
            .map_err(db_err("Query execution logs"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Query execution logs"))?;

        Ok(Page {
            items,
            pagination: Pagination::new(req, total as u64),
        })
    }
}
