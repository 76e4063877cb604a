mod agents;
mod conversations;
mod cursors;
mod events;
mod instructions;
mod journal;
mod lock;
mod publish;
mod runs;
mod snapshots;
pub mod types;

pub use conversations::ActivityCursor;
pub use publish::{AUTO_SUMMARY_KEY, PublishOutcome, PublishRequest, upsert_auto_summary};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::lifecycle::LifecycleComponent;
use crate::core::vault::PayloadVault;

/// Default lease TTL after which a held agent lock is reclaimable.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(4 * 60 * 60);

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS agent_profiles (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        mode TEXT NOT NULL,
        managed_sources_json TEXT NOT NULL,
        instruction_id TEXT,
        generation_model TEXT NOT NULL,
        generation_effort TEXT NOT NULL,
        customer_model TEXT NOT NULL,
        cadence_days INTEGER NOT NULL,
        evaluation_window_days INTEGER NOT NULL,
        ghost_followup_hours INTEGER NOT NULL,
        compaction_trigger_tokens INTEGER NOT NULL,
        baseline_score REAL NOT NULL,
        max_iterations INTEGER NOT NULL,
        self_tests_json TEXT NOT NULL,
        status TEXT NOT NULL,
        locked_at_ms INTEGER,
        lock_owner TEXT,
        lock_run_id TEXT,
        last_scheduled_run_date TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        run_type TEXT NOT NULL,
        dry_run INTEGER NOT NULL,
        status TEXT NOT NULL,
        scheduled_for TEXT,
        started_at TEXT,
        ended_at TEXT,
        stop_requested_at TEXT,
        stop_requested_by TEXT,
        cursor_before_json TEXT NOT NULL DEFAULT '{}',
        cursor_after_json TEXT NOT NULL DEFAULT '{}',
        iteration INTEGER NOT NULL DEFAULT 0,
        self_test_count INTEGER NOT NULL DEFAULT 0,
        published_version INTEGER,
        seq_counter INTEGER NOT NULL DEFAULT 0,
        max_iterations INTEGER NOT NULL,
        batch_size INTEGER NOT NULL,
        max_messages INTEGER NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        error TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_runs_agent_created ON runs(agent_id, created_at)",
    "CREATE TABLE IF NOT EXISTS run_events (
        run_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        ts TEXT NOT NULL,
        phase TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        payload_ref TEXT,
        created_by TEXT NOT NULL,
        UNIQUE(run_id, seq)
    )",
    "CREATE TABLE IF NOT EXISTS generation_snapshots (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL,
        turn_id TEXT NOT NULL,
        direction TEXT NOT NULL,
        model TEXT NOT NULL,
        masked_payload_json TEXT NOT NULL,
        encrypted_payload TEXT NOT NULL,
        usage_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_generation_snapshots_run ON generation_snapshots(run_id, created_at)",
    "CREATE TABLE IF NOT EXISTS snapshot_access_audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        snapshot_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        actor TEXT NOT NULL,
        reason TEXT,
        accessed_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS source_cursors (
        agent_id TEXT NOT NULL,
        source TEXT NOT NULL,
        last_processed_at_ms INTEGER,
        last_message_id TEXT,
        last_run_id TEXT,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (agent_id, source)
    )",
    "CREATE TABLE IF NOT EXISTS decision_journal (
        run_id TEXT NOT NULL,
        iteration INTEGER NOT NULL,
        decision TEXT NOT NULL,
        reasoning TEXT NOT NULL,
        action_plan_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE(run_id, iteration)
    )",
    "CREATE TABLE IF NOT EXISTS evaluation_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        iteration INTEGER NOT NULL,
        case_id TEXT NOT NULL,
        category TEXT NOT NULL,
        scores_json TEXT NOT NULL,
        weighted_score REAL NOT NULL,
        passed INTEGER NOT NULL,
        violations_json TEXT NOT NULL,
        transcript_json TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_evaluation_results_run ON evaluation_results(run_id, iteration)",
    "CREATE TABLE IF NOT EXISTS instructions (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        version INTEGER NOT NULL,
        blocks_json TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS instruction_versions (
        instruction_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        blocks_json TEXT NOT NULL,
        source_run_id TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (instruction_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS conversation_messages (
        message_id TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        counterparty_id TEXT NOT NULL,
        role TEXT NOT NULL,
        text TEXT NOT NULL,
        sent_at_ms INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_conversation_messages_source_sent ON conversation_messages(source, sent_at_ms)",
    "CREATE INDEX IF NOT EXISTS idx_conversation_messages_counterparty ON conversation_messages(counterparty_id, sent_at_ms)",
];

/// SQLite-backed persistence for agent profiles, runs, events, snapshots,
/// cursors, audit stores and the instruction documents they publish into.
#[derive(Clone)]
pub struct ForgeStore {
    db: Arc<Mutex<Connection>>,
    vault: Arc<PayloadVault>,
    lock_ttl: Duration,
}

impl ForgeStore {
    pub async fn open<P: AsRef<Path>>(data_dir: P, vault: PayloadVault) -> Result<Self> {
        let data_dir: PathBuf = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            tokio::fs::create_dir_all(&data_dir).await?;
        }
        let db_path = data_dir.join("forge.db");
        let db = Connection::open(&db_path)?;
        db.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_schema(&db)?;
        info!("Forge store opened at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            vault: Arc::new(vault),
            lock_ttl: DEFAULT_LOCK_TTL,
        })
    }

    pub fn open_in_memory(vault: PayloadVault) -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            vault: Arc::new(vault),
            lock_ttl: DEFAULT_LOCK_TTL,
        })
    }

    fn init_schema(db: &Connection) -> Result<()> {
        for stmt in SCHEMA {
            db.execute(stmt, [])?;
        }
        Ok(())
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }
}

pub(crate) fn now_ts() -> String {
    ts(Utc::now())
}

pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

pub(crate) fn json_or_default(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({}))
}

/// In-memory store with a fixed vault key. Avoids filesystem side-effects.
#[cfg(test)]
pub fn test_store() -> ForgeStore {
    ForgeStore::open_in_memory(PayloadVault::from_secret("forge-test-secret"))
        .expect("open in-memory store")
}

#[cfg(test)]
impl ForgeStore {
    /// Run raw SQL against the store, for tests that need to break a table.
    pub async fn execute_batch_for_test(&self, sql: &str) {
        self.db
            .lock()
            .await
            .execute_batch(sql)
            .expect("test sql");
    }
}

#[async_trait]
impl LifecycleComponent for ForgeStore {
    async fn on_init(&mut self) -> Result<()> {
        info!("Forge store (SQLite) initializing...");
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Forge store shutting down...");
        Ok(())
    }
}
