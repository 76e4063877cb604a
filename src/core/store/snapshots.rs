use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;
use tracing::info;

use super::types::{GenerationSnapshot, SnapshotAccessRecord};
use super::{ForgeStore, json_or_default, now_ts};
use crate::core::forge::masking::mask_payload;

const SNAPSHOT_COLUMNS: &str = "id, run_id, turn_id, direction, model, masked_payload_json, usage_json, created_at";

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<GenerationSnapshot> {
    let masked: String = row.get(5)?;
    let usage: String = row.get(6)?;
    Ok(GenerationSnapshot {
        id: row.get(0)?,
        run_id: row.get(1)?,
        turn_id: row.get(2)?,
        direction: row.get(3)?,
        model: row.get(4)?,
        masked_payload: json_or_default(&masked),
        usage: json_or_default(&usage),
        created_at: row.get(7)?,
    })
}

impl ForgeStore {
    /// Store a generation request/response twice: a masked, readable copy and
    /// the full payload encrypted with the store's vault.
    pub async fn save_snapshot(
        &self,
        run_id: &str,
        turn_id: &str,
        direction: &str,
        model: &str,
        payload: &Value,
        usage: &Value,
    ) -> Result<GenerationSnapshot> {
        let id = uuid::Uuid::new_v4().to_string();
        let masked = mask_payload(payload);
        let encrypted = self.vault.encrypt(&serde_json::to_string(payload)?)?;
        let created_at = now_ts();

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO generation_snapshots (id, run_id, turn_id, direction, model, masked_payload_json,
                encrypted_payload, usage_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                run_id,
                turn_id,
                direction,
                model,
                serde_json::to_string(&masked)?,
                encrypted,
                serde_json::to_string(usage)?,
                created_at,
            ],
        )?;
        Ok(GenerationSnapshot {
            id,
            run_id: run_id.to_string(),
            turn_id: turn_id.to_string(),
            direction: direction.to_string(),
            model: model.to_string(),
            masked_payload: masked,
            usage: usage.clone(),
            created_at,
        })
    }

    pub async fn list_snapshots(&self, run_id: &str) -> Result<Vec<GenerationSnapshot>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM generation_snapshots WHERE run_id = ?1 ORDER BY created_at ASC, rowid ASC",
            SNAPSHOT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id], row_to_snapshot)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<GenerationSnapshot>> {
        let db = self.db.lock().await;
        let snap = db
            .query_row(
                &format!("SELECT {} FROM generation_snapshots WHERE id = ?1", SNAPSHOT_COLUMNS),
                params![snapshot_id],
                row_to_snapshot,
            )
            .optional()?;
        Ok(snap)
    }

    /// Decrypt the full payload. Every successful unmask writes an access
    /// audit row in the same transaction as the read.
    pub async fn unmask_snapshot(
        &self,
        snapshot_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Option<Value>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT run_id, encrypted_payload FROM generation_snapshots WHERE id = ?1",
                params![snapshot_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((run_id, encrypted)) = row else {
            return Ok(None);
        };

        let plaintext = self.vault.decrypt(&encrypted)?;
        let payload: Value = serde_json::from_str(&plaintext)?;

        tx.execute(
            "INSERT INTO snapshot_access_audit (snapshot_id, run_id, actor, reason, accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![snapshot_id, run_id, actor, reason, now_ts()],
        )?;
        tx.commit()?;
        info!("Snapshot {} unmasked by {}", snapshot_id, actor);
        Ok(Some(payload))
    }

    pub async fn list_snapshot_access(&self, snapshot_id: &str) -> Result<Vec<SnapshotAccessRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT snapshot_id, run_id, actor, reason, accessed_at FROM snapshot_access_audit
             WHERE snapshot_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![snapshot_id], |row| {
            Ok(SnapshotAccessRecord {
                snapshot_id: row.get(0)?,
                run_id: row.get(1)?,
                actor: row.get(2)?,
                reason: row.get(3)?,
                accessed_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
