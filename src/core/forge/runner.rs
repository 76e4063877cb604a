use chrono::Utc;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::context::RunContext;
use super::decision::decide;
use super::error::{ForgeError, ForgeResult};
use super::history::{FetchLimits, HistoryReader, fetch_history};
use super::patch::{FailedCase, InsightDigest, generate_patch, refine_patch};
use super::selftest::run_self_tests;
use super::types::{AgentStatus, Decision, Phase, RunStatus, RunType, StartRunOptions};
use crate::core::llm::GenerationProvider;
use crate::core::store::types::{AgentProfile, CursorAdvance, NewRun, RunFinalization, RunRecord};
use crate::core::store::{ForgeStore, PublishOutcome, PublishRequest};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Recorded as `lock_owner` on acquired leases.
    pub owner: String,
    pub refresh_interval: Duration,
    pub default_max_iterations: u32,
    pub default_batch_size: usize,
    pub default_max_messages: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            owner: format!("forge-runner-{}", std::process::id()),
            refresh_interval: Duration::from_secs(60),
            default_max_iterations: 3,
            default_batch_size: 50,
            default_max_messages: 40,
        }
    }
}

/// Where a run begins its pipeline.
#[derive(Debug, Clone)]
enum Resume {
    Fresh,
    FromDigest(InsightDigest),
    FromPatch(String),
}

/// Result of a start request. `handle` is present only when the lock was
/// acquired and the run was spawned.
pub struct StartedRun {
    pub run: RunRecord,
    pub accepted: bool,
    pub handle: Option<JoinHandle<RunStatus>>,
}

struct RunState {
    iteration: u32,
    self_test_count: u32,
    metadata: Map<String, Value>,
    cursor_advances: Vec<CursorAdvance>,
}

impl RunState {
    fn set(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    fn metadata(&self) -> Value {
        Value::Object(self.metadata.clone())
    }
}

/// Drives runs end to end: lock, history, patch, evaluate/decide loop, and
/// publish or finalize. One spawned task per run.
#[derive(Clone)]
pub struct ForgeRunner {
    store: ForgeStore,
    history: Arc<dyn HistoryReader>,
    provider: Option<Arc<dyn GenerationProvider>>,
    settings: RunnerSettings,
}

impl ForgeRunner {
    pub fn new(
        store: ForgeStore,
        history: Arc<dyn HistoryReader>,
        provider: Option<Arc<dyn GenerationProvider>>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            history,
            provider,
            settings,
        }
    }

    pub fn store(&self) -> &ForgeStore {
        &self.store
    }

    /// Create a run, take the agent lock synchronously, and spawn the run.
    /// Contention yields a `rejected_concurrent` run, not an error.
    pub async fn start_run(&self, agent_id: &str, opts: StartRunOptions) -> ForgeResult<StartedRun> {
        self.start_run_for(agent_id, opts, None).await
    }

    pub async fn start_run_for(
        &self,
        agent_id: &str,
        opts: StartRunOptions,
        scheduled_for: Option<String>,
    ) -> ForgeResult<StartedRun> {
        let profile = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| ForgeError::AgentNotFound(agent_id.to_string()))?;
        let run_type = opts.run_type.unwrap_or(RunType::Manual);
        if run_type == RunType::Replay {
            return Err(ForgeError::InvalidRequest(
                "replay runs are started from a checkpoint or a self-test replay".to_string(),
            ));
        }
        let new = NewRun {
            agent_id: profile.id.clone(),
            run_type,
            dry_run: opts.dry_run,
            scheduled_for,
            max_iterations: opts
                .max_iterations
                .unwrap_or(profile.max_iterations)
                .max(1),
            batch_size: opts
                .batch_size
                .unwrap_or(self.settings.default_batch_size)
                .max(1),
            max_messages: opts
                .max_messages
                .unwrap_or(self.settings.default_max_messages)
                .max(1),
            metadata: json!({
                "requestedBy": opts.requested_by.unwrap_or_else(|| "operator".to_string()),
                "baselineScore": profile.baseline_score,
            }),
        };
        self.launch(profile, new, Resume::Fresh).await
    }

    /// Re-run from a recorded checkpoint of `source_run_id` as a dry replay.
    pub async fn replay_from_checkpoint(
        &self,
        source_run_id: &str,
        from_seq: i64,
        requested_by: &str,
    ) -> ForgeResult<StartedRun> {
        let source = self
            .store
            .get_run(source_run_id)
            .await?
            .ok_or_else(|| ForgeError::RunNotFound(source_run_id.to_string()))?;
        let missing = || ForgeError::CheckpointNotFound {
            run_id: source_run_id.to_string(),
            seq: from_seq,
        };
        let event = self
            .store
            .get_event(source_run_id, from_seq)
            .await?
            .filter(|e| e.event_type == "checkpoint")
            .ok_or_else(missing)?;

        let name = event.payload["name"].as_str().unwrap_or_default();
        let state = &event.payload["state"];
        let resume = match name {
            "run_started" => Resume::Fresh,
            "history_complete" => {
                let digest: InsightDigest = serde_json::from_value(state["digest"].clone())
                    .map_err(|e| ForgeError::InvalidRequest(format!("checkpoint digest unreadable: {}", e)))?;
                Resume::FromDigest(digest)
            }
            "patch_generated" | "iteration_complete" => {
                let patch = state["patch"].as_str().ok_or_else(missing)?;
                Resume::FromPatch(patch.to_string())
            }
            _ => return Err(missing()),
        };

        let profile = self
            .store
            .get_agent(&source.agent_id)
            .await?
            .ok_or_else(|| ForgeError::AgentNotFound(source.agent_id.clone()))?;
        let new = NewRun {
            agent_id: profile.id.clone(),
            run_type: RunType::Replay,
            dry_run: true,
            scheduled_for: None,
            max_iterations: source.max_iterations,
            batch_size: source.batch_size,
            max_messages: source.max_messages,
            metadata: json!({
                "requestedBy": requested_by,
                "baselineScore": profile.baseline_score,
                "replayOf": {"runId": source_run_id, "fromSeq": from_seq, "checkpoint": name},
            }),
        };
        self.launch(profile, new, resume).await
    }

    /// Re-evaluate the candidate patch of `source_run_id` for one iteration.
    pub async fn replay_self_tests(&self, source_run_id: &str, requested_by: &str) -> ForgeResult<StartedRun> {
        let source = self
            .store
            .get_run(source_run_id)
            .await?
            .ok_or_else(|| ForgeError::RunNotFound(source_run_id.to_string()))?;
        let patch = source.metadata["candidatePatch"]
            .as_str()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ForgeError::InvalidRequest(format!("run {} has no candidate patch", source_run_id)))?
            .to_string();
        let profile = self
            .store
            .get_agent(&source.agent_id)
            .await?
            .ok_or_else(|| ForgeError::AgentNotFound(source.agent_id.clone()))?;
        let new = NewRun {
            agent_id: profile.id.clone(),
            run_type: RunType::Replay,
            dry_run: true,
            scheduled_for: None,
            max_iterations: 1,
            batch_size: source.batch_size,
            max_messages: source.max_messages,
            metadata: json!({
                "requestedBy": requested_by,
                "baselineScore": profile.baseline_score,
                "replayOf": {"runId": source_run_id, "selfTests": true},
            }),
        };
        self.launch(profile, new, Resume::FromPatch(patch)).await
    }

    /// Record a stop request. The running task observes it at its next
    /// checkpoint; terminal runs are returned unchanged.
    pub async fn stop_run(&self, run_id: &str, requested_by: &str) -> ForgeResult<RunRecord> {
        let run = self
            .store
            .request_stop(run_id, requested_by)
            .await?
            .ok_or_else(|| ForgeError::RunNotFound(run_id.to_string()))?;
        if !run.status.is_terminal() && run.stop_requested_by.as_deref() == Some(requested_by) {
            self.store
                .append_event_as(
                    run_id,
                    Phase::Runtime,
                    "stop_requested",
                    json!({"requestedBy": requested_by}),
                    None,
                    requested_by,
                )
                .await?;
        }
        Ok(run)
    }

    /// Start a run and wait for its terminal record. Used by the CLI.
    pub async fn run_to_completion(&self, agent_id: &str, opts: StartRunOptions) -> ForgeResult<RunRecord> {
        let started = self.start_run(agent_id, opts).await?;
        if let Some(handle) = started.handle {
            handle
                .await
                .map_err(|e| ForgeError::Other(anyhow::anyhow!("run task aborted: {}", e)))?;
        }
        self.store
            .get_run(&started.run.id)
            .await?
            .ok_or_else(|| ForgeError::RunNotFound(started.run.id.clone()))
    }

    async fn launch(&self, profile: AgentProfile, new: NewRun, resume: Resume) -> ForgeResult<StartedRun> {
        let run = self.store.create_run(&new).await?;
        let lock = self
            .store
            .acquire_lock(&profile.id, &run.id, &self.settings.owner)
            .await?;

        if !lock.acquired {
            let reason = lock.reason.unwrap_or_else(|| "already_running".to_string());
            self.store
                .append_event(&run.id, Phase::Runtime, "run_rejected", json!({"reason": reason}))
                .await?;
            self.store.reject_run(&run.id, &reason).await?;
            info!("Run {} for agent {} rejected: {}", run.id, profile.id, reason);
            let run = self
                .store
                .get_run(&run.id)
                .await?
                .ok_or_else(|| ForgeError::RunNotFound(run.id.clone()))?;
            return Ok(StartedRun {
                run,
                accepted: false,
                handle: None,
            });
        }

        let run = self
            .store
            .get_run(&run.id)
            .await?
            .ok_or_else(|| ForgeError::RunNotFound(run.id.clone()))?;
        info!(
            "Run {} started for agent {} ({}, dry_run={})",
            run.id,
            profile.id,
            run.run_type.as_str(),
            run.dry_run
        );
        let runner = self.clone();
        let spawned = run.clone();
        let handle = tokio::spawn(async move { runner.execute(spawned, profile, resume).await });
        Ok(StartedRun {
            run,
            accepted: true,
            handle: Some(handle),
        })
    }

    /// Top level of a run. Cancellation and failures are mapped to terminal
    /// states here and nowhere else; the lock is always released.
    async fn execute(&self, run: RunRecord, profile: AgentProfile, resume: Resume) -> RunStatus {
        let mut ctx = RunContext::new(
            self.store.clone(),
            run.id.clone(),
            profile.id.clone(),
            self.provider.clone(),
            self.settings.refresh_interval,
        );
        let mut state = RunState {
            iteration: 0,
            self_test_count: 0,
            metadata: run.metadata.as_object().cloned().unwrap_or_default(),
            cursor_advances: Vec::new(),
        };

        let status = match self.drive(&mut ctx, &run, &profile, resume, &mut state).await {
            Ok(status) => status,
            Err(ForgeError::Cancelled(_)) => {
                info!("Run {} stopped by request", run.id);
                state.set("toolTallies", ctx.tallies());
                self.finish_quietly(&ctx, &run, &mut state, RunStatus::Stopped, None)
                    .await
            }
            Err(e) => {
                error!("Run {} failed: {}", run.id, e);
                state.set("toolTallies", ctx.tallies());
                self.finish_quietly(&ctx, &run, &mut state, RunStatus::Failed, Some(e.to_string()))
                    .await
            }
        };

        // Secondary release; only matters if finalization itself failed.
        if let Err(e) = self
            .store
            .release_lock(&profile.id, &run.id, AgentStatus::Active)
            .await
        {
            warn!("Secondary lock release for run {} failed: {}", run.id, e);
        }
        status
    }

    async fn drive(
        &self,
        ctx: &mut RunContext,
        run: &RunRecord,
        profile: &AgentProfile,
        resume: Resume,
        state: &mut RunState,
    ) -> ForgeResult<RunStatus> {
        ctx.checkpoint_event(
            "run_started",
            json!({
                "runType": run.run_type,
                "dryRun": run.dry_run,
                "maxIterations": run.max_iterations,
            }),
        )
        .await?;
        ctx.checkpoint("run_started").await?;

        let instruction = match &profile.instruction_id {
            Some(id) => self.store.get_instruction(id).await?,
            None => None,
        };
        let expected_version = instruction.as_ref().map(|d| d.version);
        let instruction_context = instruction.as_ref().map(|d| d.render()).unwrap_or_default();
        state.set("instructionVersionAtStart", json!(expected_version));

        let cursors = self.store.list_cursors(&profile.id).await?;
        let mut before = Map::new();
        for c in &cursors {
            before.insert(
                c.source.clone(),
                json!({"lastProcessedAt": c.last_processed_at, "lastMessageId": c.last_message_id}),
            );
        }
        self.store.set_cursor_before(&run.id, &Value::Object(before)).await?;

        let mut patch = match resume {
            Resume::Fresh => {
                let outcome = fetch_history(
                    ctx,
                    profile,
                    self.history.as_ref(),
                    &FetchLimits {
                        batch_size: run.batch_size,
                        max_messages: run.max_messages,
                        now: Utc::now(),
                    },
                )
                .await?;
                let digest = InsightDigest::from_insights(&outcome.insights, profile.ghost_followup_hours, Utc::now());
                state.cursor_advances = outcome.cursor_advances.clone();
                state.set(
                    "history",
                    json!({
                        "conversations": outcome.processed.len(),
                        "tokenEstimate": outcome.estimate,
                        "compactions": outcome.compactions,
                    }),
                );
                ctx.emit(
                    Phase::History,
                    "history_complete",
                    json!({
                        "conversations": outcome.processed.len(),
                        "insights": outcome.insights.len(),
                        "cursorAdvances": outcome.cursor_advances,
                    }),
                )
                .await?;
                ctx.checkpoint_event(
                    "history_complete",
                    json!({"digest": digest, "cursorAdvances": outcome.cursor_advances}),
                )
                .await?;
                self.initial_patch(ctx, profile, &instruction_context, &digest, state)
                    .await?
            }
            Resume::FromDigest(digest) => {
                self.initial_patch(ctx, profile, &instruction_context, &digest, state)
                    .await?
            }
            Resume::FromPatch(patch) => {
                state.set("candidatePatch", json!(patch));
                patch
            }
        };

        loop {
            state.iteration += 1;
            let iteration = state.iteration;
            ctx.checkpoint("iteration_start").await?;

            let (outcomes, summary) = run_self_tests(ctx, profile, &patch, iteration).await?;
            state.self_test_count += outcomes.len() as u32;

            let outcome = decide(iteration, run.max_iterations, &summary, profile.baseline_score);
            let failed: Vec<FailedCase> = outcomes
                .iter()
                .filter(|o| !o.score.passed)
                .map(|o| FailedCase {
                    case_id: o.case_id.clone(),
                    violations: o.violations.clone(),
                })
                .collect();
            let pass_next = if run.dry_run { "finish_dry_run" } else { "publish" };
            let action_plan = match outcome.decision {
                Decision::StopPass => json!({"next": pass_next}),
                Decision::StopFail => json!({"next": "needs_review"}),
                Decision::Continue => json!({"next": "refine", "failedCases": failed}),
            };
            self.store
                .record_decision(&run.id, iteration, outcome.decision, &outcome.reasoning, &action_plan)
                .await?;
            ctx.emit(
                Phase::Decision,
                "decision",
                json!({
                    "iteration": iteration,
                    "decision": outcome.decision,
                    "reasoning": outcome.reasoning,
                }),
            )
            .await?;

            state.set("lastSelfTest", json!(summary));
            state.set("decision", json!(outcome.decision));
            state.set("decisionReasoning", json!(outcome.reasoning));
            state.set("toolTallies", ctx.tallies());
            self.store
                .update_run_progress(&run.id, state.iteration, state.self_test_count, &state.metadata())
                .await?;
            ctx.checkpoint_event(
                "iteration_complete",
                json!({"iteration": iteration, "patch": patch, "summary": summary}),
            )
            .await?;

            match outcome.decision {
                Decision::StopPass => break,
                Decision::StopFail => {
                    return self
                        .finish(ctx, run, state, RunStatus::NeedsReview, None, false)
                        .await;
                }
                Decision::Continue => {
                    let draft = refine_patch(ctx, profile, &patch, &failed, iteration + 1).await?;
                    patch = draft.text;
                    state.set("candidatePatch", json!(patch));
                    state.set("patchOrigin", json!(draft.origin));
                }
            }
        }

        // A stop recorded while the last iteration was in flight still wins.
        ctx.checkpoint("publish").await?;

        if run.dry_run {
            return self
                .finish(ctx, run, state, RunStatus::CompletedDryRun, None, false)
                .await;
        }
        let (Some(instruction_id), Some(expected_version)) = (profile.instruction_id.clone(), expected_version) else {
            state.set("publishSkipped", json!("no_instruction_target"));
            return self
                .finish(ctx, run, state, RunStatus::CompletedNoPublish, None, true)
                .await;
        };

        state.set("toolTallies", ctx.tallies());
        ctx.emit(
            Phase::Publish,
            "publish_started",
            json!({"instructionId": instruction_id, "expectedVersion": expected_version}),
        )
        .await?;
        let request = PublishRequest {
            run_id: run.id.clone(),
            agent_id: profile.id.clone(),
            instruction_id: instruction_id.clone(),
            expected_version,
            patch_text: patch.clone(),
            finalization: RunFinalization {
                status: RunStatus::Completed,
                iteration: state.iteration,
                self_test_count: state.self_test_count,
                metadata: state.metadata(),
                error: None,
                cursor_advances: state.cursor_advances.clone(),
            },
        };
        match self.store.publish(&request).await? {
            PublishOutcome::Published { version } => {
                ctx.emit(
                    Phase::Publish,
                    "publish_committed",
                    json!({"instructionId": instruction_id, "version": version}),
                )
                .await?;
                info!("Run {} completed and published v{}", run.id, version);
                Ok(RunStatus::Completed)
            }
            PublishOutcome::Conflict { expected, actual } => {
                let conflict = json!({
                    "instructionId": instruction_id,
                    "expectedVersion": expected,
                    "actualVersion": actual,
                });
                ctx.emit(Phase::Publish, "publish_conflict", conflict.clone()).await?;
                state.set("publishConflict", conflict);
                self.finish(ctx, run, state, RunStatus::NeedsReview, None, false)
                    .await
            }
            PublishOutcome::LeaseLost { holder } => {
                warn!("Run {} lost its lease before publish; holder {:?}", run.id, holder);
                let lost = json!({"instructionId": instruction_id, "holderRunId": holder});
                ctx.emit(Phase::Publish, "publish_lease_lost", lost.clone()).await?;
                state.set("leaseLost", lost);
                self.finish(ctx, run, state, RunStatus::NeedsReview, None, false)
                    .await
            }
        }
    }

    async fn initial_patch(
        &self,
        ctx: &mut RunContext,
        profile: &AgentProfile,
        instruction_context: &str,
        digest: &InsightDigest,
        state: &mut RunState,
    ) -> ForgeResult<String> {
        let draft = generate_patch(ctx, profile, instruction_context, digest).await?;
        state.set("candidatePatch", json!(draft.text));
        state.set("patchOrigin", json!(draft.origin));
        ctx.checkpoint_event("patch_generated", json!({"patch": draft.text}))
            .await?;
        Ok(draft.text)
    }

    /// Terminal write without publish. Cursors advance only for a non-dry
    /// run when `advance_cursors` is set.
    async fn finish(
        &self,
        ctx: &RunContext,
        run: &RunRecord,
        state: &mut RunState,
        status: RunStatus,
        error: Option<String>,
        advance_cursors: bool,
    ) -> ForgeResult<RunStatus> {
        state.set("toolTallies", ctx.tallies());
        ctx.emit(
            Phase::Runtime,
            "run_finished",
            json!({"status": status, "iteration": state.iteration, "error": error}),
        )
        .await?;
        let cursor_advances = if advance_cursors && !run.dry_run {
            state.cursor_advances.clone()
        } else {
            Vec::new()
        };
        self.store
            .finalize_run(
                &ctx.agent_id,
                &run.id,
                &RunFinalization {
                    status,
                    iteration: state.iteration,
                    self_test_count: state.self_test_count,
                    metadata: state.metadata(),
                    error,
                    cursor_advances,
                },
            )
            .await?;
        Ok(status)
    }

    /// `finish` for the error paths: its own failure is logged, never raised.
    async fn finish_quietly(
        &self,
        ctx: &RunContext,
        run: &RunRecord,
        state: &mut RunState,
        status: RunStatus,
        error: Option<String>,
    ) -> RunStatus {
        if let Err(e) = self.finish(ctx, run, state, status, error, false).await {
            error!("Finalizing run {} as {} failed: {}", run.id, status.as_str(), e);
        }
        status
    }
}
