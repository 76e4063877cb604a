use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::error::{ForgeError, ForgeResult};
use super::types::Phase;
use crate::core::llm::{GenerationProvider, GenerationRequest, GenerationResponse};
use crate::core::store::ForgeStore;
use crate::core::store::types::RunEvent;

/// Per-run handle shared by every stage: event emission, cooperative stop
/// checks, throttled lease refresh, tool tallies and audited generation calls.
pub struct RunContext {
    pub store: ForgeStore,
    pub run_id: String,
    pub agent_id: String,
    provider: Option<Arc<dyn GenerationProvider>>,
    refresh_interval: Duration,
    last_refresh: Instant,
    tallies: BTreeMap<String, u64>,
}

impl RunContext {
    pub fn new(
        store: ForgeStore,
        run_id: impl Into<String>,
        agent_id: impl Into<String>,
        provider: Option<Arc<dyn GenerationProvider>>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            store,
            run_id: run_id.into(),
            agent_id: agent_id.into(),
            provider,
            refresh_interval,
            last_refresh: Instant::now(),
            tallies: BTreeMap::new(),
        }
    }

    /// Stop marker is read on every call; the lease is refreshed at most once
    /// per refresh interval.
    pub async fn checkpoint(&mut self, at: &str) -> ForgeResult<()> {
        if self.store.is_stop_requested(&self.run_id).await? {
            debug!("Run {} observed stop request at {}", self.run_id, at);
            return Err(ForgeError::Cancelled(self.run_id.clone()));
        }
        if self.last_refresh.elapsed() >= self.refresh_interval {
            if !self.store.refresh_lock(&self.agent_id, &self.run_id).await {
                warn!("Run {} could not refresh its lease at {}", self.run_id, at);
            }
            self.last_refresh = Instant::now();
        }
        Ok(())
    }

    pub async fn emit(&self, phase: Phase, event_type: &str, payload: Value) -> ForgeResult<RunEvent> {
        Ok(self
            .store
            .append_event(&self.run_id, phase, event_type, payload)
            .await?)
    }

    /// Named replay point; `payload` must carry everything needed to resume.
    pub async fn checkpoint_event(&self, name: &str, payload: Value) -> ForgeResult<RunEvent> {
        self.emit(Phase::Runtime, "checkpoint", json!({"name": name, "state": payload}))
            .await
    }

    pub fn tally(&mut self, tool: &str) {
        *self.tallies.entry(tool.to_string()).or_insert(0) += 1;
    }

    pub fn tallies(&self) -> Value {
        json!(self.tallies)
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// Call the generation provider with request and response snapshotted
    /// before use. Any failure or empty text is logged as a non-fatal event
    /// and reported as `None` so the caller can fall back.
    pub async fn generate(&mut self, turn_id: &str, request: GenerationRequest) -> ForgeResult<Option<GenerationResponse>> {
        let Some(provider) = self.provider.clone() else {
            return Ok(None);
        };
        self.tally("generation");

        let request_payload = serde_json::to_value(&request).map_err(anyhow::Error::from)?;
        let req_snap = self
            .store
            .save_snapshot(&self.run_id, turn_id, "request", &request.model, &request_payload, &json!({}))
            .await?;

        let started = Instant::now();
        match provider.generate(&request).await {
            Ok(response) => {
                let usage = serde_json::to_value(&response.usage).map_err(anyhow::Error::from)?;
                let res_snap = self
                    .store
                    .save_snapshot(
                        &self.run_id,
                        turn_id,
                        "response",
                        &request.model,
                        &json!({"text": response.text}),
                        &usage,
                    )
                    .await?;
                if response.text.trim().is_empty() {
                    self.store
                        .append_event_as(
                            &self.run_id,
                            Phase::Openai,
                            "generation_empty",
                            json!({"turnId": turn_id, "provider": provider.name(), "fallback": true}),
                            Some(&res_snap.id),
                            "runner",
                        )
                        .await?;
                    return Ok(None);
                }
                self.store
                    .append_event_as(
                        &self.run_id,
                        Phase::Openai,
                        "generation_complete",
                        json!({
                            "turnId": turn_id,
                            "model": request.model,
                            "latencyMs": started.elapsed().as_millis() as u64,
                            "usage": usage,
                        }),
                        Some(&res_snap.id),
                        "runner",
                    )
                    .await?;
                Ok(Some(response))
            }
            Err(e) => {
                warn!("Generation for run {} ({}) failed, using fallback: {}", self.run_id, turn_id, e);
                self.store
                    .append_event_as(
                        &self.run_id,
                        Phase::Openai,
                        "generation_failed",
                        json!({
                            "turnId": turn_id,
                            "provider": provider.name(),
                            "error": e.to_string(),
                            "fallback": true,
                        }),
                        Some(&req_snap.id),
                        "runner",
                    )
                    .await?;
                Ok(None)
            }
        }
    }
}
