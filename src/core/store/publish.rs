use anyhow::{Result, bail};
use rusqlite::{OptionalExtension, Transaction, params};
use tracing::{info, warn};

use super::cursors::upsert_cursors_tx;
use super::runs::cursor_map;
use super::types::{InstructionBlock, RunFinalization};
use super::{ForgeStore, now_ts};
use crate::core::forge::can_transition;
use crate::core::forge::types::{AgentStatus, RunStatus};

/// Key of the single block a run owns inside an instruction document.
pub const AUTO_SUMMARY_KEY: &str = "agent_forge_auto_summary";
pub const AUTO_SUMMARY_TITLE: &str = "Agent Forge auto-summary";

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub run_id: String,
    pub agent_id: String,
    pub instruction_id: String,
    /// Version observed when the run started.
    pub expected_version: i64,
    pub patch_text: String,
    /// Counters, metadata and cursor advances written with the publish. The
    /// status is always `completed`.
    pub finalization: RunFinalization,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Published { version: i64 },
    Conflict { expected: i64, actual: Option<i64> },
    /// The run no longer owns the agent lease; nothing was written.
    LeaseLost { holder: Option<String> },
}

/// Replace the auto-summary block in place, or append it when absent.
pub fn upsert_auto_summary(blocks: &mut Vec<InstructionBlock>, patch_text: &str) {
    let block = InstructionBlock {
        key: AUTO_SUMMARY_KEY.to_string(),
        title: AUTO_SUMMARY_TITLE.to_string(),
        content: patch_text.to_string(),
    };
    match blocks.iter_mut().find(|b| b.key == AUTO_SUMMARY_KEY) {
        Some(existing) => *existing = block,
        None => blocks.push(block),
    }
}

/// Current lease holder of an agent, read inside a transaction.
pub(crate) fn lock_holder_tx(tx: &Transaction<'_>, agent_id: &str) -> rusqlite::Result<Option<String>> {
    Ok(tx
        .query_row(
            "SELECT lock_run_id FROM agent_profiles WHERE id = ?1",
            params![agent_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten())
}

impl ForgeStore {
    /// Commit an accepted patch: instruction block + version bump, version
    /// history row, cursor advances, run completion, and lock release. Either
    /// all of it lands or none of it does. A version mismatch is reported as
    /// [`PublishOutcome::Conflict`], and a lease taken over by another run as
    /// [`PublishOutcome::LeaseLost`], both with nothing written.
    pub async fn publish(&self, req: &PublishRequest) -> Result<PublishOutcome> {
        let now = now_ts();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let holder = lock_holder_tx(&tx, &req.agent_id)?;
        if holder.as_deref() != Some(req.run_id.as_str()) {
            warn!(
                "Publish for run {}: lease on agent {} is held by {:?}",
                req.run_id, req.agent_id, holder
            );
            return Ok(PublishOutcome::LeaseLost { holder });
        }

        let current: Option<(i64, String)> = tx
            .query_row(
                "SELECT version, blocks_json FROM instructions WHERE id = ?1",
                params![req.instruction_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((version, blocks_json)) = current else {
            warn!("Publish for run {}: instruction {} is gone", req.run_id, req.instruction_id);
            return Ok(PublishOutcome::Conflict {
                expected: req.expected_version,
                actual: None,
            });
        };
        if version != req.expected_version {
            warn!(
                "Publish for run {}: version conflict (expected {}, found {})",
                req.run_id, req.expected_version, version
            );
            return Ok(PublishOutcome::Conflict {
                expected: req.expected_version,
                actual: Some(version),
            });
        }

        let run_status: Option<String> = tx
            .query_row("SELECT status FROM runs WHERE id = ?1", params![req.run_id], |r| r.get(0))
            .optional()?;
        let Some(run_status) = run_status.as_deref().and_then(RunStatus::from_status) else {
            bail!("run {} not found", req.run_id);
        };
        if !can_transition(run_status, RunStatus::Completed) {
            bail!("run {} cannot complete from {}", req.run_id, run_status.as_str());
        }

        let mut blocks: Vec<InstructionBlock> = serde_json::from_str(&blocks_json)?;
        upsert_auto_summary(&mut blocks, &req.patch_text);
        let new_blocks = serde_json::to_string(&blocks)?;
        let new_version = version + 1;

        let rows = tx.execute(
            "UPDATE instructions SET version = ?3, blocks_json = ?4, updated_at = ?5 WHERE id = ?1 AND version = ?2",
            params![req.instruction_id, version, new_version, new_blocks, now],
        )?;
        if rows == 0 {
            return Ok(PublishOutcome::Conflict {
                expected: req.expected_version,
                actual: None,
            });
        }
        tx.execute(
            "INSERT INTO instruction_versions (instruction_id, version, blocks_json, source_run_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![req.instruction_id, new_version, new_blocks, req.run_id, now],
        )?;

        let fin = &req.finalization;
        upsert_cursors_tx(&tx, &req.agent_id, &req.run_id, &fin.cursor_advances)?;

        tx.execute(
            "UPDATE runs SET status = 'completed', ended_at = ?2, iteration = ?3, self_test_count = ?4,
                metadata_json = ?5, error = NULL, published_version = ?6, cursor_after_json = ?7
             WHERE id = ?1",
            params![
                req.run_id,
                now,
                fin.iteration,
                fin.self_test_count,
                serde_json::to_string(&fin.metadata)?,
                new_version,
                serde_json::to_string(&cursor_map(&fin.cursor_advances))?,
            ],
        )?;
        tx.execute(
            "UPDATE agent_profiles
             SET locked_at_ms = NULL, lock_owner = NULL, lock_run_id = NULL, status = ?3, updated_at = ?4
             WHERE id = ?1 AND lock_run_id = ?2",
            params![req.agent_id, req.run_id, AgentStatus::Active.as_str(), now],
        )?;
        tx.commit()?;

        info!(
            "Run {} published instruction {} v{}",
            req.run_id, req.instruction_id, new_version
        );
        Ok(PublishOutcome::Published { version: new_version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::forge::types::RunType;
    use crate::core::store::test_store;
    use crate::core::store::types::{AgentProfileInput, CursorAdvance, NewRun};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        agent: String,
        run: String,
        instruction: String,
    }

    async fn fixture(store: &ForgeStore) -> Fixture {
        let doc = store
            .create_instruction(
                "assistant",
                &[InstructionBlock {
                    key: "base".into(),
                    title: "Base".into(),
                    content: "Be helpful.".into(),
                }],
            )
            .await
            .unwrap();
        let agent = store
            .create_agent(&AgentProfileInput {
                name: Some("pub".into()),
                instruction_id: Some(doc.id.clone()),
                managed_sources: Some(vec!["facebook:1".into()]),
                ..Default::default()
            })
            .await
            .unwrap();
        let run = store
            .create_run(&NewRun {
                agent_id: agent.id.clone(),
                run_type: RunType::Manual,
                dry_run: false,
                scheduled_for: None,
                max_iterations: 3,
                batch_size: 10,
                max_messages: 10,
                metadata: json!({}),
            })
            .await
            .unwrap();
        store.acquire_lock(&agent.id, &run.id, "runner").await.unwrap();
        Fixture {
            agent: agent.id,
            run: run.id,
            instruction: doc.id,
        }
    }

    fn request(f: &Fixture, expected_version: i64) -> PublishRequest {
        PublishRequest {
            run_id: f.run.clone(),
            agent_id: f.agent.clone(),
            instruction_id: f.instruction.clone(),
            expected_version,
            patch_text: "Always confirm size and payment.".into(),
            finalization: RunFinalization {
                status: RunStatus::Completed,
                iteration: 1,
                self_test_count: 5,
                metadata: json!({"decision": "stop_pass"}),
                error: None,
                cursor_advances: vec![CursorAdvance {
                    source: "facebook:1".into(),
                    last_processed_at: Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap(),
                    last_message_id: Some("m1".into()),
                }],
            },
        }
    }

    #[test]
    fn auto_summary_is_replaced_not_duplicated() {
        let mut blocks = Vec::new();
        upsert_auto_summary(&mut blocks, "v1");
        upsert_auto_summary(&mut blocks, "v2");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content, "v2");
    }

    #[tokio::test]
    async fn publish_commits_everything() {
        let store = test_store();
        let f = fixture(&store).await;

        let outcome = store.publish(&request(&f, 1)).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Published { version: 2 });

        let doc = store.get_instruction(&f.instruction).await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.blocks.len(), 2);
        assert_eq!(doc.blocks[1].key, AUTO_SUMMARY_KEY);

        let versions = store.list_instruction_versions(&f.instruction).await.unwrap();
        assert_eq!(versions.last().unwrap().source_run_id.as_deref(), Some(f.run.as_str()));

        let run = store.get_run(&f.run).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.published_version, Some(2));

        assert!(store.get_cursor(&f.agent, "facebook:1").await.unwrap().is_some());
        let agent = store.get_agent(&f.agent).await.unwrap().unwrap();
        assert!(agent.lock_run_id.is_none());
        assert_eq!(agent.status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn version_conflict_leaves_everything_unchanged() {
        let store = test_store();
        let f = fixture(&store).await;

        // Concurrent human edit moves the document to v2.
        store
            .update_instruction(
                &f.instruction,
                1,
                &[InstructionBlock {
                    key: "base".into(),
                    title: "Base".into(),
                    content: "Edited by a human.".into(),
                }],
            )
            .await
            .unwrap();

        let outcome = store.publish(&request(&f, 1)).await.unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Conflict {
                expected: 1,
                actual: Some(2)
            }
        );

        let doc = store.get_instruction(&f.instruction).await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.blocks[0].content, "Edited by a human.");
        assert_eq!(store.list_instruction_versions(&f.instruction).await.unwrap().len(), 2);
        assert!(store.get_cursor(&f.agent, "facebook:1").await.unwrap().is_none());

        let run = store.get_run(&f.run).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.published_version.is_none());
        let agent = store.get_agent(&f.agent).await.unwrap().unwrap();
        assert_eq!(agent.lock_run_id.as_deref(), Some(f.run.as_str()));
    }

    #[tokio::test]
    async fn reclaimed_lease_blocks_publish() {
        let store = test_store().with_lock_ttl(Duration::from_millis(1));
        let f = fixture(&store).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let successor = store
            .create_run(&NewRun {
                agent_id: f.agent.clone(),
                run_type: RunType::Scheduled,
                dry_run: false,
                scheduled_for: None,
                max_iterations: 3,
                batch_size: 10,
                max_messages: 10,
                metadata: json!({}),
            })
            .await
            .unwrap();
        assert!(store.acquire_lock(&f.agent, &successor.id, "runner").await.unwrap().acquired);

        let outcome = store.publish(&request(&f, 1)).await.unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::LeaseLost {
                holder: Some(successor.id.clone())
            }
        );

        let doc = store.get_instruction(&f.instruction).await.unwrap().unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(store.list_instruction_versions(&f.instruction).await.unwrap().len(), 1);
        assert!(store.get_cursor(&f.agent, "facebook:1").await.unwrap().is_none());
        let run = store.get_run(&f.run).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        let agent = store.get_agent(&f.agent).await.unwrap().unwrap();
        assert_eq!(agent.lock_run_id.as_deref(), Some(successor.id.as_str()));
    }
}
