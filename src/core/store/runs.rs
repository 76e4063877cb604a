use anyhow::{Result, bail};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;
use tracing::{info, warn};

use super::cursors::upsert_cursors_tx;
use super::publish::lock_holder_tx;
use super::types::{CursorAdvance, NewRun, RunFinalization, RunRecord};
use super::{ForgeStore, json_or_default, now_ts};
use crate::core::forge::can_transition;
use crate::core::forge::types::{AgentStatus, RunStatus, RunType};

const RUN_COLUMNS: &str = "id, agent_id, run_type, dry_run, status, scheduled_for, started_at, ended_at, \
     stop_requested_at, stop_requested_by, cursor_before_json, cursor_after_json, iteration, \
     self_test_count, published_version, seq_counter, max_iterations, batch_size, max_messages, \
     metadata_json, error, created_at";

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let run_type: String = row.get(2)?;
    let status: String = row.get(4)?;
    let cursor_before: String = row.get(10)?;
    let cursor_after: String = row.get(11)?;
    let metadata: String = row.get(19)?;
    let batch_size: i64 = row.get(17)?;
    let max_messages: i64 = row.get(18)?;
    Ok(RunRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        run_type: RunType::from_str_opt(&run_type).unwrap_or(RunType::Manual),
        dry_run: row.get::<_, i64>(3)? != 0,
        status: RunStatus::from_status(&status).unwrap_or(RunStatus::Failed),
        scheduled_for: row.get(5)?,
        started_at: row.get(6)?,
        ended_at: row.get(7)?,
        stop_requested_at: row.get(8)?,
        stop_requested_by: row.get(9)?,
        cursor_before: json_or_default(&cursor_before),
        cursor_after: json_or_default(&cursor_after),
        iteration: row.get(12)?,
        self_test_count: row.get(13)?,
        published_version: row.get(14)?,
        seq_counter: row.get(15)?,
        max_iterations: row.get(16)?,
        batch_size: batch_size.max(0) as usize,
        max_messages: max_messages.max(0) as usize,
        metadata: json_or_default(&metadata),
        error: row.get(20)?,
        created_at: row.get(21)?,
    })
}

/// `{source: {lastProcessedAt, lastMessageId}}` view stored as `cursor_after`.
pub(crate) fn cursor_map(advances: &[CursorAdvance]) -> Value {
    let mut map = serde_json::Map::new();
    for adv in advances {
        map.insert(
            adv.source.clone(),
            serde_json::json!({
                "lastProcessedAt": super::ts(adv.last_processed_at),
                "lastMessageId": adv.last_message_id,
            }),
        );
    }
    Value::Object(map)
}

impl ForgeStore {
    pub async fn create_run(&self, new: &NewRun) -> Result<RunRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO runs (id, agent_id, run_type, dry_run, status, scheduled_for, max_iterations,
                batch_size, max_messages, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                new.agent_id,
                new.run_type.as_str(),
                new.dry_run as i64,
                new.scheduled_for,
                new.max_iterations,
                new.batch_size as i64,
                new.max_messages as i64,
                serde_json::to_string(&new.metadata)?,
                now_ts(),
            ],
        )?;
        let run = db.query_row(
            &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
            params![id],
            row_to_run,
        )?;
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let db = self.db.lock().await;
        let run = db
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, agent_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM runs WHERE agent_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![agent_id, limit as i64], row_to_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Set the stop marker. Idempotent: the first requester and timestamp win,
    /// and terminal runs are left alone.
    pub async fn request_stop(&self, run_id: &str, requested_by: &str) -> Result<Option<RunRecord>> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE runs SET stop_requested_at = ?2, stop_requested_by = ?3
             WHERE id = ?1 AND stop_requested_at IS NULL AND status IN ('queued', 'running')",
            params![run_id, now_ts(), requested_by],
        )?;
        let run = db
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    pub async fn is_stop_requested(&self, run_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let marker: Option<Option<String>> = db
            .query_row(
                "SELECT stop_requested_at FROM runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(matches!(marker, Some(Some(_))))
    }

    pub async fn set_cursor_before(&self, run_id: &str, cursor_before: &Value) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE runs SET cursor_before_json = ?2 WHERE id = ?1",
            params![run_id, serde_json::to_string(cursor_before)?],
        )?;
        Ok(())
    }

    /// Persist in-flight counters. Ignored once the run is terminal.
    pub async fn update_run_progress(
        &self,
        run_id: &str,
        iteration: u32,
        self_test_count: u32,
        metadata: &Value,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE runs SET iteration = ?2, self_test_count = ?3, metadata_json = ?4
             WHERE id = ?1 AND status = 'running'",
            params![run_id, iteration, self_test_count, serde_json::to_string(metadata)?],
        )?;
        Ok(())
    }

    /// Terminal record for a run whose lock attempt failed.
    pub async fn reject_run(&self, run_id: &str, reason: &str) -> Result<()> {
        let db = self.db.lock().await;
        let status: Option<String> = db
            .query_row("SELECT status FROM runs WHERE id = ?1", params![run_id], |r| r.get(0))
            .optional()?;
        let Some(status) = status.as_deref().and_then(RunStatus::from_status) else {
            bail!("run {} not found", run_id);
        };
        if !can_transition(status, RunStatus::RejectedConcurrent) {
            bail!("run {} cannot move from {} to rejected_concurrent", run_id, status.as_str());
        }
        db.execute(
            "UPDATE runs SET status = 'rejected_concurrent', ended_at = ?2, error = ?3 WHERE id = ?1",
            params![run_id, now_ts(), reason],
        )?;
        Ok(())
    }

    /// Write the terminal status, optionally advance cursors, and release the
    /// agent lock, all in one transaction. Cursors only move while the run
    /// still holds the lease. Returns `false` (and writes
    /// nothing) when the run is already terminal.
    pub async fn finalize_run(&self, agent_id: &str, run_id: &str, fin: &RunFinalization) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let status: Option<String> = tx
            .query_row("SELECT status FROM runs WHERE id = ?1", params![run_id], |r| r.get(0))
            .optional()?;
        let Some(current) = status.as_deref().and_then(RunStatus::from_status) else {
            bail!("run {} not found", run_id);
        };
        if !can_transition(current, fin.status) {
            warn!(
                "Run {} finalize ignored: {} -> {} not allowed",
                run_id,
                current.as_str(),
                fin.status.as_str()
            );
            return Ok(false);
        }

        let owns_lease = lock_holder_tx(&tx, agent_id)?.as_deref() == Some(run_id);
        if !fin.cursor_advances.is_empty() && !owns_lease {
            warn!("Run {} lost its lease on agent {}; cursors not advanced", run_id, agent_id);
        }
        let cursor_after = if fin.cursor_advances.is_empty() || !owns_lease {
            None
        } else {
            upsert_cursors_tx(&tx, agent_id, run_id, &fin.cursor_advances)?;
            Some(serde_json::to_string(&cursor_map(&fin.cursor_advances))?)
        };

        tx.execute(
            "UPDATE runs SET status = ?2, ended_at = ?3, iteration = ?4, self_test_count = ?5,
                metadata_json = ?6, error = ?7, cursor_after_json = COALESCE(?8, cursor_after_json)
             WHERE id = ?1",
            params![
                run_id,
                fin.status.as_str(),
                now_ts(),
                fin.iteration,
                fin.self_test_count,
                serde_json::to_string(&fin.metadata)?,
                fin.error,
                cursor_after,
            ],
        )?;
        tx.execute(
            "UPDATE agent_profiles
             SET locked_at_ms = NULL, lock_owner = NULL, lock_run_id = NULL, status = ?3, updated_at = ?4
             WHERE id = ?1 AND lock_run_id = ?2",
            params![agent_id, run_id, AgentStatus::Active.as_str(), now_ts()],
        )?;
        tx.commit()?;
        info!("Run {} finalized as {}", run_id, fin.status.as_str());
        Ok(true)
    }
}
