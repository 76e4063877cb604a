use anyhow::{Result, bail};
use rusqlite::{OptionalExtension, Row, params};

use super::types::{InstructionBlock, InstructionDocument, InstructionVersion};
use super::{ForgeStore, now_ts};

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<InstructionDocument> {
    let blocks: String = row.get(3)?;
    Ok(InstructionDocument {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        blocks: serde_json::from_str(&blocks).unwrap_or_default(),
        updated_at: row.get(4)?,
    })
}

impl ForgeStore {
    /// Create an instruction document at version 1 together with its first
    /// history row.
    pub async fn create_instruction(&self, name: &str, blocks: &[InstructionBlock]) -> Result<InstructionDocument> {
        if name.trim().is_empty() {
            bail!("instruction name is required");
        }
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        let blocks_json = serde_json::to_string(blocks)?;

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO instructions (id, name, version, blocks_json, updated_at) VALUES (?1, ?2, 1, ?3, ?4)",
            params![id, name.trim(), blocks_json, now],
        )?;
        tx.execute(
            "INSERT INTO instruction_versions (instruction_id, version, blocks_json, source_run_id, created_at)
             VALUES (?1, 1, ?2, NULL, ?3)",
            params![id, blocks_json, now],
        )?;
        tx.commit()?;

        Ok(InstructionDocument {
            id,
            name: name.trim().to_string(),
            version: 1,
            blocks: blocks.to_vec(),
            updated_at: now,
        })
    }

    pub async fn get_instruction(&self, instruction_id: &str) -> Result<Option<InstructionDocument>> {
        let db = self.db.lock().await;
        let doc = db
            .query_row(
                "SELECT id, name, version, blocks_json, updated_at FROM instructions WHERE id = ?1",
                params![instruction_id],
                row_to_document,
            )
            .optional()?;
        Ok(doc)
    }

    /// Replace all blocks if the stored version still equals `expected_version`.
    /// Returns the new version, or `None` when the version moved on.
    pub async fn update_instruction(
        &self,
        instruction_id: &str,
        expected_version: i64,
        blocks: &[InstructionBlock],
    ) -> Result<Option<i64>> {
        let now = now_ts();
        let blocks_json = serde_json::to_string(blocks)?;

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let rows = tx.execute(
            "UPDATE instructions SET version = version + 1, blocks_json = ?3, updated_at = ?4
             WHERE id = ?1 AND version = ?2",
            params![instruction_id, expected_version, blocks_json, now],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        let new_version = expected_version + 1;
        tx.execute(
            "INSERT INTO instruction_versions (instruction_id, version, blocks_json, source_run_id, created_at)
             VALUES (?1, ?2, ?3, NULL, ?4)",
            params![instruction_id, new_version, blocks_json, now],
        )?;
        tx.commit()?;
        Ok(Some(new_version))
    }

    pub async fn list_instruction_versions(&self, instruction_id: &str) -> Result<Vec<InstructionVersion>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT instruction_id, version, blocks_json, source_run_id, created_at
             FROM instruction_versions WHERE instruction_id = ?1 ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![instruction_id], |row| {
            let blocks: String = row.get(2)?;
            Ok(InstructionVersion {
                instruction_id: row.get(0)?,
                version: row.get(1)?,
                blocks: serde_json::from_str(&blocks).unwrap_or_default(),
                source_run_id: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
