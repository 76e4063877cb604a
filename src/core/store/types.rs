use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::forge::types::{
    AgentMode, AgentStatus, RunStatus, RunType, SelfTestCase,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub mode: AgentMode,
    pub managed_sources: Vec<String>,
    pub instruction_id: Option<String>,
    pub generation_model: String,
    pub generation_effort: String,
    pub customer_model: String,
    pub cadence_days: i64,
    pub evaluation_window_days: i64,
    pub ghost_followup_hours: i64,
    pub compaction_trigger_tokens: i64,
    pub baseline_score: f64,
    pub max_iterations: u32,
    pub self_test_cases: Vec<SelfTestCase>,
    pub status: AgentStatus,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub lock_run_id: Option<String>,
    pub last_scheduled_run_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Create/update payload for an agent profile. Absent fields keep their
/// current (or default) value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfileInput {
    pub name: Option<String>,
    pub mode: Option<AgentMode>,
    pub managed_sources: Option<Vec<String>>,
    pub instruction_id: Option<String>,
    pub generation_model: Option<String>,
    pub generation_effort: Option<String>,
    pub customer_model: Option<String>,
    pub cadence_days: Option<i64>,
    pub evaluation_window_days: Option<i64>,
    pub ghost_followup_hours: Option<i64>,
    pub compaction_trigger_tokens: Option<i64>,
    pub baseline_score: Option<f64>,
    pub max_iterations: Option<u32>,
    pub self_test_cases: Option<Vec<SelfTestCase>>,
    pub status: Option<AgentStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOutcome {
    pub acquired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LockOutcome {
    pub fn acquired() -> Self {
        Self {
            acquired: true,
            reason: None,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self {
            acquired: false,
            reason: Some(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub agent_id: String,
    pub run_type: RunType,
    pub dry_run: bool,
    pub status: RunStatus,
    pub scheduled_for: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub stop_requested_at: Option<String>,
    pub stop_requested_by: Option<String>,
    pub cursor_before: serde_json::Value,
    pub cursor_after: serde_json::Value,
    pub iteration: u32,
    pub self_test_count: u32,
    pub published_version: Option<i64>,
    pub seq_counter: i64,
    pub max_iterations: u32,
    pub batch_size: usize,
    pub max_messages: usize,
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub agent_id: String,
    pub run_type: RunType,
    pub dry_run: bool,
    pub scheduled_for: Option<String>,
    pub max_iterations: u32,
    pub batch_size: usize,
    pub max_messages: usize,
    pub metadata: serde_json::Value,
}

/// Terminal write applied together with lock release.
#[derive(Debug, Clone)]
pub struct RunFinalization {
    pub status: RunStatus,
    pub iteration: u32,
    pub self_test_count: u32,
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    pub cursor_advances: Vec<CursorAdvance>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: String,
    pub seq: i64,
    pub ts: String,
    pub phase: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub payload_ref: Option<String>,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSnapshot {
    pub id: String,
    pub run_id: String,
    pub turn_id: String,
    pub direction: String,
    pub model: String,
    pub masked_payload: serde_json::Value,
    pub usage: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCursor {
    pub agent_id: String,
    pub source: String,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_message_id: Option<String>,
    pub last_run_id: Option<String>,
    pub updated_at: String,
}

/// Cursor position reached by a run for one source; applied only on commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorAdvance {
    pub source: String,
    pub last_processed_at: DateTime<Utc>,
    pub last_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionJournalEntry {
    pub run_id: String,
    pub iteration: u32,
    pub decision: String,
    pub reasoning: String,
    pub action_plan: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub run_id: String,
    pub iteration: u32,
    pub case_id: String,
    pub category: String,
    pub scores: serde_json::Value,
    pub weighted_score: f64,
    pub passed: bool,
    pub violations: Vec<String>,
    pub transcript: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionBlock {
    pub key: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionDocument {
    pub id: String,
    pub name: String,
    pub version: i64,
    pub blocks: Vec<InstructionBlock>,
    pub updated_at: String,
}

impl InstructionDocument {
    /// Flattened text used as the effective instruction.
    pub fn render(&self) -> String {
        self.blocks
            .iter()
            .map(|b| format!("## {}\n{}", b.title, b.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionVersion {
    pub instruction_id: String,
    pub version: i64,
    pub blocks: Vec<InstructionBlock>,
    pub source_run_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotAccessRecord {
    pub snapshot_id: String,
    pub run_id: String,
    pub actor: String,
    pub reason: Option<String>,
    pub accessed_at: String,
}

/// A stored conversation turn, read back by the history reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub message_id: String,
    pub source: String,
    pub counterparty_id: String,
    pub role: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// One counterparty with activity in a source since a given instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterpartyActivity {
    pub counterparty_id: String,
    pub source: String,
    pub last_message_at: DateTime<Utc>,
    pub message_count: i64,
}
