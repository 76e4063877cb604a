use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::forge::history::StoreHistoryReader;
use crate::core::forge::{ForgeRunner, RunType, RunnerSettings};
use crate::core::llm::{GenerationProvider, GenerationRequest, GenerationResponse, Usage};
use crate::core::store::ForgeStore;
use crate::core::store::types::{
    AgentProfile, AgentProfileInput, ConversationMessage, InstructionBlock, InstructionDocument,
    NewRun,
};

pub const SOURCE: &str = "facebook:page-1";

pub async fn instruction(store: &ForgeStore) -> InstructionDocument {
    store
        .create_instruction(
            "Shop assistant",
            &[InstructionBlock {
                key: "base".into(),
                title: "Base".into(),
                content: "Be polite and concise.".into(),
            }],
        )
        .await
        .unwrap()
}

pub async fn agent(store: &ForgeStore, instruction_id: Option<&str>) -> AgentProfile {
    store
        .create_agent(&AgentProfileInput {
            name: Some("Shop bot".into()),
            managed_sources: Some(vec![SOURCE.into()]),
            instruction_id: instruction_id.map(str::to_string),
            ..Default::default()
        })
        .await
        .unwrap()
}

fn message(id: &str, counterparty: &str, role: &str, text: &str, at: DateTime<Utc>) -> ConversationMessage {
    ConversationMessage {
        message_id: id.into(),
        source: SOURCE.into(),
        counterparty_id: counterparty.into(),
        role: role.into(),
        text: text.into(),
        sent_at: at,
    }
}

/// Two recent conversations; returns the newest message time.
pub async fn seed_conversations(store: &ForgeStore) -> DateTime<Utc> {
    let now = Utc::now();
    let newest = now - Duration::hours(1);
    let messages = vec![
        message("m1", "cust-a", "user", "How much is the red dress?", now - Duration::hours(5)),
        message("m2", "cust-a", "assistant", "It is 590 baht.", now - Duration::hours(4)),
        message("m3", "cust-b", "user", "Can I pay by bank transfer?", now - Duration::hours(3)),
        message("m4", "cust-b", "assistant", "Yes, bank transfer works.", newest),
    ];
    store.insert_messages(&messages).await.unwrap();
    newest
}

pub fn runner(store: &ForgeStore, provider: Option<Arc<dyn GenerationProvider>>) -> ForgeRunner {
    ForgeRunner::new(
        store.clone(),
        Arc::new(StoreHistoryReader::new(store.clone())),
        provider,
        RunnerSettings {
            owner: "test-runner".into(),
            ..Default::default()
        },
    )
}

fn response(text: &str) -> GenerationResponse {
    GenerationResponse {
        text: text.to_string(),
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        },
    }
}

/// Always errors, as an unreachable endpoint would.
pub struct FailingProvider;

#[async_trait]
impl GenerationProvider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResponse> {
        bail!("connection refused")
    }
}

/// Answers every call with the same text.
pub struct FixedProvider {
    pub text: String,
    pub calls: AtomicUsize,
}

impl FixedProvider {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl GenerationProvider for FixedProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(response(&self.text))
    }
}

/// Side effect fired on the first call whose model matches `model`.
pub enum Trigger {
    /// Request a stop on the agent's newest run.
    StopRun { agent_id: String },
    /// Publish a competing instruction version.
    BumpInstruction { instruction_id: String },
    /// Let the lease go stale, then hand it to a fresh run.
    StealLease { agent_id: String },
}

/// Returns empty text (so every stage falls back) and fires `trigger` once.
pub struct TriggerProvider {
    pub store: ForgeStore,
    pub model: String,
    pub trigger: Trigger,
    pub fired: AtomicUsize,
}

#[async_trait]
impl GenerationProvider for TriggerProvider {
    fn name(&self) -> &str {
        "trigger"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        if request.model == self.model && self.fired.fetch_add(1, Ordering::SeqCst) == 0 {
            match &self.trigger {
                Trigger::StopRun { agent_id } => {
                    let runs = self.store.list_runs(agent_id, 1).await?;
                    if let Some(run) = runs.first() {
                        self.store.request_stop(&run.id, "operator").await?;
                    }
                }
                Trigger::BumpInstruction { instruction_id } => {
                    let doc = self.store.get_instruction(instruction_id).await?;
                    if let Some(doc) = doc {
                        self.store
                            .update_instruction(instruction_id, doc.version, &doc.blocks)
                            .await?;
                    }
                }
                Trigger::StealLease { agent_id } => {
                    tokio::time::sleep(self.store.lock_ttl() * 5).await;
                    let successor = self
                        .store
                        .create_run(&NewRun {
                            agent_id: agent_id.clone(),
                            run_type: RunType::Scheduled,
                            dry_run: false,
                            scheduled_for: None,
                            max_iterations: 1,
                            batch_size: 10,
                            max_messages: 10,
                            metadata: serde_json::json!({}),
                        })
                        .await?;
                    self.store
                        .acquire_lock(agent_id, &successor.id, "other-runner")
                        .await?;
                }
            }
        }
        Ok(response(""))
    }
}
