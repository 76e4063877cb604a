use anyhow::Result;
use rusqlite::{OptionalExtension, Row, Transaction, params};

use super::types::{CursorAdvance, SourceCursor};
use super::{ForgeStore, from_ms, now_ts};

fn row_to_cursor(row: &Row<'_>) -> rusqlite::Result<SourceCursor> {
    Ok(SourceCursor {
        agent_id: row.get(0)?,
        source: row.get(1)?,
        last_processed_at: from_ms(row.get(2)?),
        last_message_id: row.get(3)?,
        last_run_id: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Upsert cursors inside an open transaction. A cursor never moves backwards:
/// an older position than the stored one is dropped.
pub(crate) fn upsert_cursors_tx(
    tx: &Transaction<'_>,
    agent_id: &str,
    run_id: &str,
    advances: &[CursorAdvance],
) -> Result<()> {
    let now = now_ts();
    for adv in advances {
        tx.execute(
            "INSERT INTO source_cursors (agent_id, source, last_processed_at_ms, last_message_id, last_run_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(agent_id, source) DO UPDATE SET
                last_processed_at_ms = excluded.last_processed_at_ms,
                last_message_id = excluded.last_message_id,
                last_run_id = excluded.last_run_id,
                updated_at = excluded.updated_at
             WHERE source_cursors.last_processed_at_ms IS NULL
                OR excluded.last_processed_at_ms >= source_cursors.last_processed_at_ms",
            params![
                agent_id,
                adv.source,
                adv.last_processed_at.timestamp_millis(),
                adv.last_message_id,
                run_id,
                now,
            ],
        )?;
    }
    Ok(())
}

impl ForgeStore {
    pub async fn list_cursors(&self, agent_id: &str) -> Result<Vec<SourceCursor>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT agent_id, source, last_processed_at_ms, last_message_id, last_run_id, updated_at
             FROM source_cursors WHERE agent_id = ?1 ORDER BY source",
        )?;
        let rows = stmt.query_map(params![agent_id], row_to_cursor)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn get_cursor(&self, agent_id: &str, source: &str) -> Result<Option<SourceCursor>> {
        let db = self.db.lock().await;
        let cursor = db
            .query_row(
                "SELECT agent_id, source, last_processed_at_ms, last_message_id, last_run_id, updated_at
                 FROM source_cursors WHERE agent_id = ?1 AND source = ?2",
                params![agent_id, source],
                row_to_cursor,
            )
            .optional()?;
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use chrono::{Duration, TimeZone, Utc};

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let store = test_store();
        let newer = Utc.with_ymd_and_hms(2026, 5, 2, 0, 0, 0).unwrap();
        let older = newer - Duration::days(1);

        for (at, id, run) in [(newer, "m2", "r1"), (older, "m1", "r2")] {
            let mut db = store.db.lock().await;
            let tx = db.transaction().unwrap();
            upsert_cursors_tx(
                &tx,
                "agent",
                run,
                &[CursorAdvance {
                    source: "line:a".into(),
                    last_processed_at: at,
                    last_message_id: Some(id.into()),
                }],
            )
            .unwrap();
            tx.commit().unwrap();
        }

        let cursor = store.get_cursor("agent", "line:a").await.unwrap().unwrap();
        assert_eq!(cursor.last_processed_at, Some(newer));
        assert_eq!(cursor.last_message_id.as_deref(), Some("m2"));
        assert_eq!(cursor.last_run_id.as_deref(), Some("r1"));
        assert_eq!(store.list_cursors("agent").await.unwrap().len(), 1);
    }
}
