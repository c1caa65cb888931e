//! Per-recipient delivery records.
//!
//! Rows are created in bulk at fan-out and then only touched by targeted
//! single-column updates, so the delivery worker and provider callbacks
//! never overwrite each other's fields.

use chrono::{DateTime, Utc};
use engage_core::error::{EngageError, Result};
use engage_core::types::{CampaignStats, DeliveryEvent, ListMember, RecipientRecord, RecipientStatus};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use crate::{EngageDb, conversion, db_err, parse_json, parse_opt_ts, ts};

const RECIPIENT_COLUMNS: &str = "campaign_id, recipient_id, address, fields_json, status, \
     sent_at, delivered_at, read_at, opened_at, clicked_at, replied_at, failed_at, \
     failure_reason, external_message_id";

fn recipient_from_row(row: &Row<'_>) -> rusqlite::Result<RecipientRecord> {
    let fields: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(RecipientRecord {
        campaign_id: row.get(0)?,
        recipient_id: row.get(1)?,
        address: row.get(2)?,
        fields: parse_json(3, &fields)?,
        status: status.parse().map_err(|e| conversion(4, e))?,
        sent_at: parse_opt_ts(5, row.get(5)?)?,
        delivered_at: parse_opt_ts(6, row.get(6)?)?,
        read_at: parse_opt_ts(7, row.get(7)?)?,
        opened_at: parse_opt_ts(8, row.get(8)?)?,
        clicked_at: parse_opt_ts(9, row.get(9)?)?,
        replied_at: parse_opt_ts(10, row.get(10)?)?,
        failed_at: parse_opt_ts(11, row.get(11)?)?,
        failure_reason: row.get(12)?,
        external_message_id: row.get(13)?,
    })
}

impl EngageDb {
    /// Create one pending record per member. Members that already have a
    /// record for this campaign are left untouched. Returns rows inserted.
    pub fn insert_recipients(&self, campaign_id: &str, members: &[ListMember]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Insert recipients"))?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO campaign_recipients
                     (campaign_id, recipient_id, address, fields_json, status)
                     VALUES (?1, ?2, ?3, ?4, 'pending')",
                )
                .map_err(db_err("Insert recipients"))?;
            for m in members {
                inserted += stmt
                    .execute(params![
                        campaign_id,
                        m.recipient_id,
                        m.address,
                        serde_json::to_string(&m.fields)?,
                    ])
                    .map_err(db_err("Insert recipient"))?;
            }
        }
        tx.commit().map_err(db_err("Insert recipients"))?;
        Ok(inserted)
    }

    /// Records of a campaign in fan-out order, optionally filtered by status.
    pub fn list_recipients(
        &self,
        campaign_id: &str,
        statuses: Option<&[RecipientStatus]>,
    ) -> Result<Vec<RecipientRecord>> {
        let mut sql = format!("SELECT {RECIPIENT_COLUMNS} FROM campaign_recipients WHERE campaign_id = ?");
        let mut args = vec![Value::Text(campaign_id.to_string())];
        if let Some(statuses) = statuses {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            sql.push_str(&format!(" AND status IN ({})", vec!["?"; statuses.len()].join(", ")));
            args.extend(statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
        }
        sql.push_str(" ORDER BY rowid");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err("List recipients"))?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), recipient_from_row)
            .map_err(db_err("List recipients"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List recipients"))
    }

    /// Reached recipients (sent, delivered or read), optionally only those
    /// that have not replied.
    pub fn reached_recipients(
        &self,
        campaign_id: &str,
        only_unreplied: bool,
    ) -> Result<Vec<RecipientRecord>> {
        let replied = if only_unreplied { " AND replied_at IS NULL" } else { "" };
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECIPIENT_COLUMNS} FROM campaign_recipients
                 WHERE campaign_id = ?1 AND status IN ('sent', 'delivered', 'read'){replied}
                 ORDER BY rowid"
            ))
            .map_err(db_err("Select follow-up recipients"))?;
        let rows = stmt
            .query_map(params![campaign_id], recipient_from_row)
            .map_err(db_err("Select follow-up recipients"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Select follow-up recipients"))
    }

    pub fn get_recipient(
        &self,
        campaign_id: &str,
        recipient_id: &str,
    ) -> Result<Option<RecipientRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {RECIPIENT_COLUMNS} FROM campaign_recipients
                 WHERE campaign_id = ?1 AND recipient_id = ?2"
            ),
            params![campaign_id, recipient_id],
            recipient_from_row,
        )
        .optional()
        .map_err(db_err("Load recipient"))
    }

    pub fn count_recipients(&self, campaign_id: &str) -> Result<u64> {
        let n: i64 = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM campaign_recipients WHERE campaign_id = ?1",
                params![campaign_id],
                |r| r.get(0),
            )
            .map_err(db_err("Count recipients"))?;
        Ok(n as u64)
    }

    /// Record an accepted initial send. Only a pending record moves to sent.
    pub fn mark_recipient_sent(
        &self,
        campaign_id: &str,
        recipient_id: &str,
        external_message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE campaign_recipients
                 SET status = 'sent', sent_at = ?3, external_message_id = ?4
                 WHERE campaign_id = ?1 AND recipient_id = ?2 AND status = 'pending'",
                params![campaign_id, recipient_id, ts(&at), external_message_id],
            )
            .map_err(db_err("Mark recipient sent"))?;
        Ok(changed > 0)
    }

    /// Record a rejected initial send. Only a pending record moves to failed.
    pub fn mark_recipient_failed(
        &self,
        campaign_id: &str,
        recipient_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE campaign_recipients
                 SET status = 'failed', failed_at = ?3, failure_reason = ?4
                 WHERE campaign_id = ?1 AND recipient_id = ?2 AND status = 'pending'",
                params![campaign_id, recipient_id, ts(&at), reason],
            )
            .map_err(db_err("Mark recipient failed"))?;
        Ok(changed > 0)
    }

    /// Apply a provider status callback to the record that carries
    /// `external_message_id`. Status only moves forward; engagement events
    /// stamp their first occurrence. Returns whether anything changed.
    pub fn apply_delivery_event(
        &self,
        external_message_id: &str,
        event: &DeliveryEvent,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let known: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM campaign_recipients WHERE external_message_id = ?1",
                params![external_message_id],
                |r| r.get(0),
            )
            .map_err(db_err("Lookup message id"))?;
        if known == 0 {
            return Err(EngageError::not_found("message", external_message_id));
        }

        let at = ts(&at);
        let changed = match event {
            DeliveryEvent::Delivered => conn.execute(
                "UPDATE campaign_recipients SET status = 'delivered', delivered_at = ?2
                 WHERE external_message_id = ?1 AND status = 'sent'",
                params![external_message_id, at],
            ),
            DeliveryEvent::Read => conn.execute(
                "UPDATE campaign_recipients SET status = 'read', read_at = ?2
                 WHERE external_message_id = ?1 AND status IN ('sent', 'delivered')",
                params![external_message_id, at],
            ),
            DeliveryEvent::Opened => conn.execute(
                "UPDATE campaign_recipients SET opened_at = ?2
                 WHERE external_message_id = ?1 AND opened_at IS NULL",
                params![external_message_id, at],
            ),
            DeliveryEvent::Clicked => conn.execute(
                "UPDATE campaign_recipients SET clicked_at = ?2
                 WHERE external_message_id = ?1 AND clicked_at IS NULL",
                params![external_message_id, at],
            ),
            DeliveryEvent::Replied => conn.execute(
                "UPDATE campaign_recipients SET replied_at = ?2
                 WHERE external_message_id = ?1 AND replied_at IS NULL",
                params![external_message_id, at],
            ),
            DeliveryEvent::Failed { reason } => conn.execute(
                "UPDATE campaign_recipients
                 SET status = 'failed', failed_at = ?2, failure_reason = ?3
                 WHERE external_message_id = ?1 AND status = 'sent'",
                params![external_message_id, at, reason],
            ),
        }
        .map_err(db_err("Apply delivery event"))?;
        Ok(changed > 0)
    }

    /// Aggregate counters for one campaign.
    pub fn campaign_stats(&self, campaign_id: &str) -> Result<CampaignStats> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status NOT IN ('pending', 'failed') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN delivered_at IS NOT NULL OR status IN ('delivered', 'read') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN opened_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN clicked_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN replied_at IS NOT NULL THEN 1 ELSE 0 END), 0)
             FROM campaign_recipients WHERE campaign_id = ?1",
            params![campaign_id],
            |r| {
                Ok(CampaignStats {
                    total: r.get::<_, i64>(0)? as u64,
                    pending: r.get::<_, i64>(1)? as u64,
                    sent: r.get::<_, i64>(2)? as u64,
                    delivered: r.get::<_, i64>(3)? as u64,
                    failed: r.get::<_, i64>(4)? as u64,
                    opened: r.get::<_, i64>(5)? as u64,
                    clicked: r.get::<_, i64>(6)? as u64,
                    replied: r.get::<_, i64>(7)? as u64,
                })
            },
        )
        .map_err(db_err("Campaign stats"))
    }

    /// Initial sends per hour, oldest bucket first.
    pub fn send_timeline(&self, campaign_id: &str) -> Result<Vec<(String, u64)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT replace(substr(sent_at, 1, 13), 'T', ' ') || ':00' AS bucket, COUNT(*)
                 FROM campaign_recipients
                 WHERE campaign_id = ?1 AND sent_at IS NOT NULL
                 GROUP BY bucket ORDER BY bucket",
            )
            .map_err(db_err("Send timeline"))?;
        let rows = stmt
            .query_map(params![campaign_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64))
            })
            .map_err(db_err("Send timeline"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Send timeline"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn members(n: usize) -> Vec<ListMember> {
        (0..n)
            .map(|i| ListMember {
                recipient_id: format!("r{i}"),
                address: Some(format!("+1000{i}")),
                fields: BTreeMap::from([("name".to_string(), format!("User {i}"))]),
            })
            .collect()
    }

    #[test]
    fn test_fanout_is_idempotent() {
        let db = EngageDb::open_in_memory().unwrap();
        assert_eq!(db.insert_recipients("c1", &members(3)).unwrap(), 3);
        assert_eq!(db.insert_recipients("c1", &members(3)).unwrap(), 0);
        assert_eq!(db.count_recipients("c1").unwrap(), 3);

        let records = db.list_recipients("c1", None).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.recipient_id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1", "r2"]);
        assert_eq!(records[1].fields.get("name").unwrap(), "User 1");
        assert!(records.iter().all(|r| r.status == RecipientStatus::Pending));
    }

    #[test]
    fn test_send_outcomes_only_from_pending() {
        let db = EngageDb::open_in_memory().unwrap();
        db.insert_recipients("c1", &members(2)).unwrap();
        let now = Utc::now();

        assert!(db.mark_recipient_sent("c1", "r0", "wamid.0", now).unwrap());
        assert!(!db.mark_recipient_failed("c1", "r0", "late failure", now).unwrap());
        assert!(db.mark_recipient_failed("c1", "r1", "bad number", now).unwrap());

        let r1 = db.get_recipient("c1", "r1").unwrap().unwrap();
        assert_eq!(r1.status, RecipientStatus::Failed);
        assert_eq!(r1.failure_reason.as_deref(), Some("bad number"));

        let pending = db
            .list_recipients("c1", Some(&[RecipientStatus::Pending]))
            .unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_delivery_events_move_forward_only() {
        let db = EngageDb::open_in_memory().unwrap();
        db.insert_recipients("c1", &members(1)).unwrap();
        let now = Utc::now();
        db.mark_recipient_sent("c1", "r0", "wamid.0", now).unwrap();

        assert!(db.apply_delivery_event("wamid.0", &DeliveryEvent::Read, now).unwrap());
        // delivered after read must not regress the status
        assert!(!db.apply_delivery_event("wamid.0", &DeliveryEvent::Delivered, now).unwrap());
        assert!(db.apply_delivery_event("wamid.0", &DeliveryEvent::Replied, now).unwrap());
        assert!(!db.apply_delivery_event("wamid.0", &DeliveryEvent::Replied, now).unwrap());

        let r = db.get_recipient("c1", "r0").unwrap().unwrap();
        assert_eq!(r.status, RecipientStatus::Read);
        assert!(r.replied_at.is_some());
        assert!(r.sent_at.is_some());

        let err = db
            .apply_delivery_event("unknown", &DeliveryEvent::Delivered, now)
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn test_reached_recipients_selection() {
        let db = EngageDb::open_in_memory().unwrap();
        db.insert_recipients("c1", &members(4)).unwrap();
        let now = Utc::now();
        db.mark_recipient_sent("c1", "r0", "m0", now).unwrap();
        db.mark_recipient_sent("c1", "r1", "m1", now).unwrap();
        db.mark_recipient_sent("c1", "r2", "m2", now).unwrap();
        db.mark_recipient_failed("c1", "r3", "x", now).unwrap();
        db.apply_delivery_event("m1", &DeliveryEvent::Delivered, now).unwrap();
        db.apply_delivery_event("m2", &DeliveryEvent::Replied, now).unwrap();

        let unreplied = db.reached_recipients("c1", true).unwrap();
        let ids: Vec<&str> = unreplied.iter().map(|r| r.recipient_id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1"]);
        assert_eq!(db.reached_recipients("c1", false).unwrap().len(), 3);
    }

    #[test]
    fn test_stats_and_timeline() {
        let db = EngageDb::open_in_memory().unwrap();
        db.insert_recipients("c1", &members(3)).unwrap();
        let now = Utc::now();
        db.mark_recipient_sent("c1", "r0", "m0", now).unwrap();
        db.mark_recipient_sent("c1", "r1", "m1", now).unwrap();
        db.apply_delivery_event("m0", &DeliveryEvent::Delivered, now).unwrap();
        db.apply_delivery_event("m0", &DeliveryEvent::Opened, now).unwrap();

        let stats = db.campaign_stats("c1").unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.opened, 1);

        let timeline = db.send_timeline("c1").unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].1, 2);
        assert!(timeline[0].0.ends_with(":00"));
    }
}
