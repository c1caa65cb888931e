//! Target lists: the store doubles as the list resolver.

use async_trait::async_trait;
use chrono::Utc;
use engage_core::error::Result;
use engage_core::traits::TargetListResolver;
use engage_core::types::ListMember;
use rusqlite::params;

use crate::{EngageDb, db_err, parse_json, ts};

impl EngageDb {
    /// Add or refresh a member of `list_id`.
    pub fn add_list_member(&self, list_id: &str, member: &ListMember) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO list_members
                 (list_id, recipient_id, address, fields_json, added_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    list_id,
                    member.recipient_id,
                    member.address,
                    serde_json::to_string(&member.fields)?,
                    ts(&Utc::now()),
                ],
            )
            .map_err(db_err("Add list member"))?;
        Ok(())
    }

    pub fn remove_list_member(&self, list_id: &str, recipient_id: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute(
                "DELETE FROM list_members WHERE list_id = ?1 AND recipient_id = ?2",
                params![list_id, recipient_id],
            )
            .map_err(db_err("Remove list member"))?;
        Ok(removed > 0)
    }

    /// Members of a list in insertion order.
    pub fn list_members(&self, list_id: &str) -> Result<Vec<ListMember>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT recipient_id, address, fields_json FROM list_members
                 WHERE list_id = ?1 ORDER BY rowid",
            )
            .map_err(db_err("List members"))?;
        let rows = stmt
            .query_map(params![list_id], |row| {
                let fields: String = row.get(2)?;
                Ok(ListMember {
                    recipient_id: row.get(0)?,
                    address: row.get(1)?,
                    fields: parse_json(2, &fields)?,
                })
            })
            .map_err(db_err("List members"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List members"))
    }
}

#[async_trait]
impl TargetListResolver for EngageDb {
    async fn resolve(&self, list_id: &str) -> Result<Vec<ListMember>> {
        self.list_members(list_id)
    }
}
