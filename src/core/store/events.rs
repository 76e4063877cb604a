use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use serde_json::Value;

use super::types::RunEvent;
use super::{ForgeStore, json_or_default, now_ts};
use crate::core::forge::masking::mask_payload;
use crate::core::forge::types::Phase;

const EVENT_COLUMNS: &str = "run_id, seq, ts, phase, event_type, payload_json, payload_ref, created_by";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<RunEvent> {
    let payload: String = row.get(5)?;
    Ok(RunEvent {
        run_id: row.get(0)?,
        seq: row.get(1)?,
        ts: row.get(2)?,
        phase: row.get(3)?,
        event_type: row.get(4)?,
        payload: json_or_default(&payload),
        payload_ref: row.get(6)?,
        created_by: row.get(7)?,
    })
}

/// Atomic increment-and-fetch of the run's private counter.
fn next_seq_tx(tx: &Transaction<'_>, run_id: &str) -> Result<i64> {
    tx.query_row(
        "UPDATE runs SET seq_counter = seq_counter + 1 WHERE id = ?1 RETURNING seq_counter",
        params![run_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| anyhow!("run {} not found", run_id))
}

impl ForgeStore {
    /// Mint the next sequence number for a run (1, 2, 3, ...).
    pub async fn next_seq(&self, run_id: &str) -> Result<i64> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let seq = next_seq_tx(&tx, run_id)?;
        tx.commit()?;
        Ok(seq)
    }

    pub async fn append_event(
        &self,
        run_id: &str,
        phase: Phase,
        event_type: &str,
        payload: Value,
    ) -> Result<RunEvent> {
        self.append_event_as(run_id, phase, event_type, payload, None, "runner")
            .await
    }

    /// Mint a seq and persist the masked payload in the same transaction, so a
    /// minted seq is never left without its row.
    pub async fn append_event_as(
        &self,
        run_id: &str,
        phase: Phase,
        event_type: &str,
        payload: Value,
        payload_ref: Option<&str>,
        created_by: &str,
    ) -> Result<RunEvent> {
        let masked = mask_payload(&payload);
        let ts = now_ts();

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let seq = next_seq_tx(&tx, run_id)?;
        tx.execute(
            "INSERT INTO run_events (run_id, seq, ts, phase, event_type, payload_json, payload_ref, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                seq,
                ts,
                phase.as_str(),
                event_type,
                serde_json::to_string(&masked)?,
                payload_ref,
                created_by,
            ],
        )?;
        tx.commit()?;

        Ok(RunEvent {
            run_id: run_id.to_string(),
            seq,
            ts,
            phase: phase.as_str().to_string(),
            event_type: event_type.to_string(),
            payload: masked,
            payload_ref: payload_ref.map(str::to_string),
            created_by: created_by.to_string(),
        })
    }

    /// Events with `seq > after_seq`, ascending, at most `limit`.
    pub async fn list_events(&self, run_id: &str, after_seq: i64, limit: usize) -> Result<Vec<RunEvent>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM run_events WHERE run_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id, after_seq, limit as i64], row_to_event)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn get_event(&self, run_id: &str, seq: i64) -> Result<Option<RunEvent>> {
        let db = self.db.lock().await;
        let event = db
            .query_row(
                &format!("SELECT {} FROM run_events WHERE run_id = ?1 AND seq = ?2", EVENT_COLUMNS),
                params![run_id, seq],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }
}
