use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue};

use super::types::{ConversationMessage, CounterpartyActivity};
use super::{ForgeStore, from_ms};

/// Position after which the next page of active counterparties starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityCursor {
    pub last_message_ms: i64,
    pub source: String,
    pub counterparty_id: String,
}

impl ActivityCursor {
    pub fn encode(&self) -> String {
        format!("{}|{}|{}", self.last_message_ms, self.source, self.counterparty_id)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, '|');
        let ms = parts.next()?.parse().ok()?;
        let source = parts.next()?.to_string();
        let counterparty_id = parts.next()?.to_string();
        Some(Self {
            last_message_ms: ms,
            source,
            counterparty_id,
        })
    }
}

impl ForgeStore {
    /// Import conversation turns. Existing message ids are skipped.
    pub async fn insert_messages(&self, messages: &[ConversationMessage]) -> Result<usize> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut inserted = 0;
        for m in messages {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO conversation_messages (message_id, source, counterparty_id, role, text, sent_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    m.message_id,
                    m.source,
                    m.counterparty_id,
                    m.role,
                    m.text,
                    m.sent_at.timestamp_millis()
                ],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Counterparties with messages after `since` in any of `sources`,
    /// ordered by their latest message, resuming after `after`. Fetches one
    /// row past `limit` so callers can tell whether more pages exist.
    pub async fn list_active_counterparties(
        &self,
        sources: &[String],
        since: DateTime<Utc>,
        after: Option<&ActivityCursor>,
        limit: usize,
    ) -> Result<(Vec<CounterpartyActivity>, bool)> {
        if sources.is_empty() || limit == 0 {
            return Ok((Vec::new(), false));
        }
        let placeholders = vec!["?"; sources.len()].join(", ");
        let mut sql = format!(
            "SELECT counterparty_id, source, MAX(sent_at_ms) AS last_at, COUNT(*) AS n
             FROM conversation_messages
             WHERE source IN ({}) AND sent_at_ms > ?
             GROUP BY counterparty_id, source",
            placeholders
        );
        let mut values: Vec<SqlValue> = sources.iter().map(|s| SqlValue::Text(s.clone())).collect();
        values.push(SqlValue::Integer(since.timestamp_millis()));
        if let Some(cursor) = after {
            sql.push_str(" HAVING (MAX(sent_at_ms), source, counterparty_id) > (?, ?, ?)");
            values.push(SqlValue::Integer(cursor.last_message_ms));
            values.push(SqlValue::Text(cursor.source.clone()));
            values.push(SqlValue::Text(cursor.counterparty_id.clone()));
        }
        sql.push_str(" ORDER BY last_at ASC, source ASC, counterparty_id ASC LIMIT ?");
        values.push(SqlValue::Integer(limit as i64 + 1));

        let db = self.db.lock().await;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            let last_at: i64 = row.get(2)?;
            Ok(CounterpartyActivity {
                counterparty_id: row.get(0)?,
                source: row.get(1)?,
                last_message_at: from_ms(Some(last_at)).unwrap_or_default(),
                message_count: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        let has_more = out.len() > limit;
        out.truncate(limit);
        Ok((out, has_more))
    }

    /// The most recent `max_messages` turns after `after`, oldest first, and
    /// whether older turns in that window were cut off.
    pub async fn conversation_messages(
        &self,
        counterparty_id: &str,
        source: &str,
        after: DateTime<Utc>,
        max_messages: usize,
    ) -> Result<(Vec<ConversationMessage>, bool)> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT message_id, source, counterparty_id, role, text, sent_at_ms
             FROM conversation_messages
             WHERE counterparty_id = ?1 AND source = ?2 AND sent_at_ms > ?3
             ORDER BY sent_at_ms DESC, message_id DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![counterparty_id, source, after.timestamp_millis(), max_messages as i64 + 1],
            |row| {
                let sent: i64 = row.get(5)?;
                Ok(ConversationMessage {
                    message_id: row.get(0)?,
                    source: row.get(1)?,
                    counterparty_id: row.get(2)?,
                    role: row.get(3)?,
                    text: row.get(4)?,
                    sent_at: from_ms(Some(sent)).unwrap_or_default(),
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        let truncated = out.len() > max_messages;
        out.truncate(max_messages);
        out.reverse();
        Ok((out, truncated))
    }
}
