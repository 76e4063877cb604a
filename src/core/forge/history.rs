//! Cursor-resuming history ingestion with a running context budget.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use tracing::info;

use super::context::RunContext;
use super::error::ForgeResult;
use super::types::Phase;
use crate::core::store::types::{AgentProfile, CounterpartyActivity, CursorAdvance};
use crate::core::store::{ActivityCursor, ForgeStore};

/// Insights kept in memory after a compaction.
pub const COMPACTION_KEEP_INSIGHTS: usize = 120;
/// Lossy reduction applied to the running estimate on compaction.
pub const COMPACTION_FACTOR: f64 = 0.4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMeta {
    pub status: String,
    pub latency_ms: u64,
    pub bytes: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct ToolResponse<T> {
    pub data: T,
    pub meta: ToolMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterpartyPage {
    pub counterparties: Vec<CounterpartyActivity>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub message_id: String,
    pub role: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Read-only access to prior conversations.
#[async_trait]
pub trait HistoryReader: Send + Sync {
    async fn list_counterparties_batch(
        &self,
        sources: &[String],
        limit: usize,
        cursor: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<ToolResponse<CounterpartyPage>>;

    async fn get_conversation(
        &self,
        counterparty_id: &str,
        source: &str,
        max_messages: usize,
        after: DateTime<Utc>,
    ) -> Result<ToolResponse<Vec<ConversationTurn>>>;
}

/// History reader over the `conversation_messages` table.
pub struct StoreHistoryReader {
    store: ForgeStore,
}

impl StoreHistoryReader {
    pub fn new(store: ForgeStore) -> Self {
        Self { store }
    }
}

fn meta_for<T: Serialize>(data: &T, started: Instant, truncated: bool) -> ToolMeta {
    ToolMeta {
        status: "ok".to_string(),
        latency_ms: started.elapsed().as_millis() as u64,
        bytes: serde_json::to_vec(data).map(|v| v.len()).unwrap_or(0),
        truncated,
    }
}

#[async_trait]
impl HistoryReader for StoreHistoryReader {
    async fn list_counterparties_batch(
        &self,
        sources: &[String],
        limit: usize,
        cursor: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<ToolResponse<CounterpartyPage>> {
        let started = Instant::now();
        let after = cursor.and_then(ActivityCursor::decode);
        let (counterparties, has_more) = self
            .store
            .list_active_counterparties(sources, since, after.as_ref(), limit)
            .await?;
        let next_cursor = if has_more {
            counterparties.last().map(|c| {
                ActivityCursor {
                    last_message_ms: c.last_message_at.timestamp_millis(),
                    source: c.source.clone(),
                    counterparty_id: c.counterparty_id.clone(),
                }
                .encode()
            })
        } else {
            None
        };
        let page = CounterpartyPage {
            counterparties,
            next_cursor,
        };
        let meta = meta_for(&page, started, has_more);
        Ok(ToolResponse { data: page, meta })
    }

    async fn get_conversation(
        &self,
        counterparty_id: &str,
        source: &str,
        max_messages: usize,
        after: DateTime<Utc>,
    ) -> Result<ToolResponse<Vec<ConversationTurn>>> {
        let started = Instant::now();
        let (messages, truncated) = self
            .store
            .conversation_messages(counterparty_id, source, after, max_messages)
            .await?;
        let turns: Vec<ConversationTurn> = messages
            .into_iter()
            .map(|m| ConversationTurn {
                message_id: m.message_id,
                role: m.role,
                text: m.text,
                sent_at: m.sent_at,
            })
            .collect();
        let meta = meta_for(&turns, started, truncated);
        Ok(ToolResponse { data: turns, meta })
    }
}

/// What one conversation contributed to the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub source: String,
    pub counterparty_id: String,
    pub customer_text: String,
    pub last_role: String,
    pub last_message_at: DateTime<Utc>,
    pub turns: usize,
}

const INSIGHT_TEXT_LIMIT: usize = 600;

impl Insight {
    fn from_turns(source: &str, counterparty_id: &str, turns: &[ConversationTurn]) -> Option<Self> {
        let last = turns.last()?;
        let mut customer_text = turns
            .iter()
            .filter(|t| t.role == "user")
            .map(|t| t.text.trim())
            .collect::<Vec<_>>()
            .join(" | ");
        if customer_text.chars().count() > INSIGHT_TEXT_LIMIT {
            customer_text = customer_text.chars().take(INSIGHT_TEXT_LIMIT).collect();
        }
        Some(Self {
            source: source.to_string(),
            counterparty_id: counterparty_id.to_string(),
            customer_text,
            last_role: last.role.clone(),
            last_message_at: last.sent_at,
            turns: turns.len(),
        })
    }
}

/// Token estimate for a batch of turns: `ceil(len(json) / 4)`.
pub fn estimate_tokens(turns: &[ConversationTurn]) -> u64 {
    let len = serde_json::to_string(turns).map(|s| s.len()).unwrap_or(0) as u64;
    len.div_ceil(4)
}

/// Running context estimate with threshold-triggered compaction.
#[derive(Debug, Clone)]
pub struct ContextBudget {
    pub trigger_tokens: u64,
    pub estimate: u64,
    pub compactions: u32,
}

impl ContextBudget {
    pub fn new(trigger_tokens: u64) -> Self {
        Self {
            trigger_tokens,
            estimate: 0,
            compactions: 0,
        }
    }

    pub fn add(&mut self, tokens: u64) {
        self.estimate = self.estimate.saturating_add(tokens);
    }

    /// Compact when the estimate is over the trigger: emit the manifest,
    /// keep only the newest insights, and scale the estimate down.
    pub async fn maybe_compact(
        &mut self,
        ctx: &RunContext,
        insights: &mut Vec<Insight>,
        manifest: serde_json::Value,
    ) -> ForgeResult<bool> {
        if self.estimate <= self.trigger_tokens {
            return Ok(false);
        }
        let before = self.estimate;
        let dropped = insights.len().saturating_sub(COMPACTION_KEEP_INSIGHTS);
        if dropped > 0 {
            insights.drain(..dropped);
        }
        self.estimate = (before as f64 * COMPACTION_FACTOR).floor() as u64;
        self.compactions += 1;

        ctx.emit(
            Phase::Compaction,
            "context_compaction",
            json!({
                "estimateBefore": before,
                "estimateAfter": self.estimate,
                "triggerTokens": self.trigger_tokens,
                "insightsDropped": dropped,
                "insightsKept": insights.len(),
                "manifest": manifest,
            }),
        )
        .await?;
        info!(
            "Run {} compacted context: {} -> {} tokens",
            ctx.run_id, before, self.estimate
        );
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct FetchLimits {
    pub batch_size: usize,
    pub max_messages: usize,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryOutcome {
    pub insights: Vec<Insight>,
    pub cursor_advances: Vec<CursorAdvance>,
    pub processed: Vec<String>,
    pub estimate: u64,
    pub compactions: u32,
}

struct Progress {
    insights: Vec<Insight>,
    processed: Vec<String>,
    last_cursor: serde_json::Value,
}

impl Progress {
    fn manifest(&self, ctx: &RunContext) -> serde_json::Value {
        json!({
            "processedCounterparties": self.processed,
            "toolTallies": ctx.tallies(),
            "lastCursor": self.last_cursor,
        })
    }
}

/// Walk every managed source from its cursor and collect conversation
/// insights. Each page and conversation fetch is logged as its own event.
pub async fn fetch_history(
    ctx: &mut RunContext,
    profile: &AgentProfile,
    reader: &dyn HistoryReader,
    limits: &FetchLimits,
) -> ForgeResult<HistoryOutcome> {
    let mut budget = ContextBudget::new(profile.compaction_trigger_tokens.max(1) as u64);
    let mut progress = Progress {
        insights: Vec::new(),
        processed: Vec::new(),
        last_cursor: json!(null),
    };
    let mut advances = Vec::new();
    let window_start = limits.now - Duration::days(profile.evaluation_window_days.max(1));

    for source in &profile.managed_sources {
        let stored = ctx.store.get_cursor(&profile.id, source).await?;
        let since = stored
            .as_ref()
            .and_then(|c| c.last_processed_at)
            .unwrap_or(window_start);
        let mut newest: Option<(DateTime<Utc>, String)> = None;
        let mut page_cursor: Option<String> = None;
        let mut page_no = 0u32;
        let sources = [source.clone()];

        loop {
            let manifest = progress.manifest(ctx);
            budget.maybe_compact(ctx, &mut progress.insights, manifest).await?;
            ctx.checkpoint("history_page").await?;

            page_no += 1;
            let page = reader
                .list_counterparties_batch(&sources, limits.batch_size, page_cursor.as_deref(), since)
                .await?;
            ctx.tally("list_counterparties_batch");
            ctx.emit(
                Phase::History,
                "history_page",
                json!({
                    "source": source,
                    "page": page_no,
                    "since": since.to_rfc3339(),
                    "count": page.data.counterparties.len(),
                    "status": page.meta.status,
                    "latencyMs": page.meta.latency_ms,
                    "bytes": page.meta.bytes,
                    "truncated": page.meta.truncated,
                }),
            )
            .await?;

            for cp in &page.data.counterparties {
                let manifest = progress.manifest(ctx);
                budget.maybe_compact(ctx, &mut progress.insights, manifest).await?;
                ctx.checkpoint("history_conversation").await?;

                let conv = reader
                    .get_conversation(&cp.counterparty_id, source, limits.max_messages, since)
                    .await?;
                ctx.tally("get_conversation");
                ctx.emit(
                    Phase::Tools,
                    "history_conversation",
                    json!({
                        "source": source,
                        "counterpartyId": cp.counterparty_id,
                        "turns": conv.data.len(),
                        "status": conv.meta.status,
                        "latencyMs": conv.meta.latency_ms,
                        "bytes": conv.meta.bytes,
                        "truncated": conv.meta.truncated,
                    }),
                )
                .await?;

                budget.add(estimate_tokens(&conv.data));
                progress.processed.push(cp.counterparty_id.clone());
                for turn in &conv.data {
                    if newest.as_ref().is_none_or(|(at, _)| turn.sent_at > *at) {
                        newest = Some((turn.sent_at, turn.message_id.clone()));
                    }
                }
                if let Some(insight) = Insight::from_turns(source, &cp.counterparty_id, &conv.data) {
                    progress.insights.push(insight);
                }
            }

            progress.last_cursor = json!({
                "source": source,
                "pageCursor": page.data.next_cursor,
                "lastProcessedAt": newest.as_ref().map(|(at, _)| at.to_rfc3339()),
            });
            match page.data.next_cursor {
                Some(next) if !page.data.counterparties.is_empty() => page_cursor = Some(next),
                _ => break,
            }
        }

        if let Some((at, message_id)) = newest {
            if at > since {
                advances.push(CursorAdvance {
                    source: source.clone(),
                    last_processed_at: at,
                    last_message_id: Some(message_id),
                });
            }
        }
    }

    Ok(HistoryOutcome {
        insights: progress.insights,
        cursor_advances: advances,
        processed: progress.processed,
        estimate: budget.estimate,
        compactions: budget.compactions,
    })
}
