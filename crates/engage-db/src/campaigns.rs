//! Campaign rows.

use chrono::{DateTime, Utc};
use engage_core::error::{EngageError, Result};
use engage_core::types::{Campaign, CampaignStatus, Page, PageRequest, Pagination};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use crate::{EngageDb, conversion, db_err, parse_json, parse_opt_ts, parse_ts, ts};

const CAMPAIGN_COLUMNS: &str = "id, name, list_id, channels_json, template_id, \
     template_variables_json, locale, sms_body, email_subject, email_body, status, scheduled_at, \
     sent_at, cancelled_at, follow_ups_json, created_at, updated_at";

fn campaign_from_row(row: &Row<'_>) -> rusqlite::Result<Campaign> {
    let channels: String = row.get(3)?;
    let variables: String = row.get(5)?;
    let status: String = row.get(10)?;
    let follow_ups: String = row.get(14)?;
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;
    Ok(Campaign {
        id: row.get(0)?,
        name: row.get(1)?,
        list_id: row.get(2)?,
        channels: parse_json(3, &channels)?,
        template_id: row.get(4)?,
        template_variables: parse_json(5, &variables)?,
        locale: row.get(6)?,
        sms_body: row.get(7)?,
        email_subject: row.get(8)?,
        email_body: row.get(9)?,
        status: status.parse().map_err(|e| conversion(10, e))?,
        scheduled_at: parse_opt_ts(11, row.get(11)?)?,
        sent_at: parse_opt_ts(12, row.get(12)?)?,
        cancelled_at: parse_opt_ts(13, row.get(13)?)?,
        follow_ups: parse_json(14, &follow_ups)?,
        created_at: parse_ts(15, &created_at)?,
        updated_at: parse_ts(16, &updated_at)?,
    })
}

fn write_campaign(conn: &Connection, c: &Campaign) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO campaigns
         (id, name, list_id, channels_json, template_id, template_variables_json, locale,
          sms_body, email_subject, email_body, status, scheduled_at, sent_at,
          cancelled_at, follow_ups_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            c.id,
            c.name,
            c.list_id,
            serde_json::to_string(&c.channels)?,
            c.template_id,
            serde_json::to_string(&c.template_variables)?,
            c.locale,
            c.sms_body,
            c.email_subject,
            c.email_body,
            c.status.as_str(),
            c.scheduled_at.as_ref().map(ts),
            c.sent_at.as_ref().map(ts),
            c.cancelled_at.as_ref().map(ts),
            serde_json::to_string(&c.follow_ups)?,
            ts(&c.created_at),
            ts(&c.updated_at),
        ],
    )
    .map_err(db_err("Save campaign"))?;
    Ok(())
}

impl EngageDb {
    /// Insert or replace a campaign row.
    pub fn save_campaign(&self, c: &Campaign) -> Result<()> {
        let conn = self.conn()?;
        write_campaign(&conn, c)
    }

    /// Replace a campaign row only while its stored status is one of
    /// `allowed`. Check and write happen under one lock.
    pub fn save_campaign_if(&self, c: &Campaign, allowed: &[CampaignStatus]) -> Result<bool> {
        let conn = self.conn()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM campaigns WHERE id = ?1",
                params![c.id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err("Load campaign status"))?;
        let Some(current) = current else {
            return Ok(false);
        };
        if !allowed.iter().any(|s| s.as_str() == current) {
            return Ok(false);
        }
        write_campaign(&conn, c)?;
        Ok(true)
    }

    pub fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
            params![id],
            campaign_from_row,
        )
        .optional()
        .map_err(db_err("Load campaign"))
    }

    /// Newest-first page of campaigns, optionally restricted to one status.
    pub fn list_campaigns(
        &self,
        status: Option<CampaignStatus>,
        req: PageRequest,
    ) -> Result<Page<Campaign>> {
        let (clause, mut args) = match status {
            Some(s) => ("WHERE status = ?", vec![Value::Text(s.as_str().to_string())]),
            None => ("", Vec::new()),
        };

        let conn = self.conn()?;
        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM campaigns {clause}"),
                params_from_iter(args.iter()),
                |r| r.get(0),
            )
            .map_err(db_err("Count campaigns"))?;

        args.push(Value::Integer(req.limit as i64));
        args.push(Value::Integer(req.offset() as i64));
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CAMPAIGN_COLUMNS} FROM campaigns {clause}
                 ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
            ))
            .map_err(db_err("List campaigns"))?;
        let items = stmt
            .query_map(params_from_iter(args.iter()), campaign_from_row)
            .map_err(db_err("List campaigns"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List campaigns"))?;

        Ok(Page {
            items,
            pagination: Pagination::new(req, total as u64),
        })
    }

    /// Delete a campaign and its recipient records.
    pub fn delete_campaign(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Delete campaign"))?;
        tx.execute("DELETE FROM campaign_recipients WHERE campaign_id = ?1", params![id])
            .map_err(db_err("Delete recipients"))?;
        let removed = tx
            .execute("DELETE FROM campaigns WHERE id = ?1", params![id])
            .map_err(db_err("Delete campaign"))?;
        tx.commit().map_err(db_err("Delete campaign"))?;
        Ok(removed > 0)
    }

    /// Move a campaign to `to` only if its current status is one of `from`.
    /// `sent` stamps `sent_at`, `cancelled` stamps `cancelled_at`.
    /// Returns false when the row was missing or in another status.
    pub fn transition_campaign(
        &self,
        id: &str,
        from: &[CampaignStatus],
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        if let Some(bad) = from.iter().find(|s| !s.can_become(to)) {
            return Err(EngageError::InvalidState(format!(
                "campaign cannot move from {bad} to {to}"
            )));
        }
        let stamp = match to {
            CampaignStatus::Sent => ", sent_at = ?",
            CampaignStatus::Cancelled => ", cancelled_at = ?",
            _ => "",
        };
        let mut args = vec![Value::Text(to.as_str().to_string()), Value::Text(ts(&at))];
        if !stamp.is_empty() {
            args.push(Value::Text(ts(&at)));
        }
        args.push(Value::Text(id.to_string()));
        let placeholders = vec!["?"; from.len()].join(", ");
        args.extend(from.iter().map(|s| Value::Text(s.as_str().to_string())));

        let changed = self
            .conn()?
            .execute(
                &format!(
                    "UPDATE campaigns SET status = ?, updated_at = ?{stamp}
                     WHERE id = ? AND status IN ({placeholders})"
                ),
                params_from_iter(args.iter()),
            )
            .map_err(db_err("Update campaign status"))?;
        if changed > 0 {
            tracing::debug!("📣 Campaign {id} → {to}");
        }
        Ok(changed > 0)
    }
}
