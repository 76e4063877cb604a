use anyhow::Result;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use tracing::{debug, info, warn};

use super::types::LockOutcome;
use super::{ForgeStore, now_ts};
use crate::core::forge::types::AgentStatus;

impl ForgeStore {
    /// Take the per-agent lease for `run_id` and flip the run to `running`.
    ///
    /// Succeeds when the agent is unlocked or its lease is older than the
    /// store's TTL. Contention is reported as `already_running`, never as an
    /// error, and leaves both rows untouched.
    pub async fn acquire_lock(&self, agent_id: &str, run_id: &str, owner: &str) -> Result<LockOutcome> {
        let now_ms = Utc::now().timestamp_millis();
        let stale_before = now_ms - self.lock_ttl.as_millis() as i64;

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM agent_profiles WHERE id = ?1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(LockOutcome::rejected("agent_not_found"));
        }

        let taken = tx.execute(
            "UPDATE agent_profiles
             SET locked_at_ms = ?2, lock_owner = ?3, lock_run_id = ?4, status = 'running', updated_at = ?5
             WHERE id = ?1
               AND (lock_run_id IS NULL OR locked_at_ms IS NULL OR locked_at_ms < ?6)",
            params![agent_id, now_ms, owner, run_id, now_ts(), stale_before],
        )?;
        if taken == 0 {
            debug!("Lock for agent {} is held; run {} rejected", agent_id, run_id);
            return Ok(LockOutcome::rejected("already_running"));
        }

        tx.execute(
            "UPDATE runs SET status = 'running', started_at = ?2 WHERE id = ?1 AND status = 'queued'",
            params![run_id, now_ts()],
        )?;
        tx.commit()?;
        info!("Lock acquired for agent {} by run {}", agent_id, run_id);
        Ok(LockOutcome::acquired())
    }

    /// Extend the lease. A no-op when `run_id` no longer owns the lock; errors
    /// are logged, never returned.
    pub async fn refresh_lock(&self, agent_id: &str, run_id: &str) -> bool {
        let db = self.db.lock().await;
        match db.execute(
            "UPDATE agent_profiles SET locked_at_ms = ?3 WHERE id = ?1 AND lock_run_id = ?2",
            params![agent_id, run_id, Utc::now().timestamp_millis()],
        ) {
            Ok(rows) => rows > 0,
            Err(e) => {
                warn!("Lock refresh for agent {} failed: {}", agent_id, e);
                false
            }
        }
    }

    /// Clear the lock and set the agent's status, only if `run_id` still owns it.
    pub async fn release_lock(&self, agent_id: &str, run_id: &str, next_status: AgentStatus) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE agent_profiles
             SET locked_at_ms = NULL, lock_owner = NULL, lock_run_id = NULL, status = ?3, updated_at = ?4
             WHERE id = ?1 AND lock_run_id = ?2",
            params![agent_id, run_id, next_status.as_str(), now_ts()],
        )?;
        if rows > 0 {
            info!("Lock released for agent {} by run {}", agent_id, run_id);
        }
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::forge::types::{RunStatus, RunType};
    use crate::core::store::test_store;
    use crate::core::store::types::{AgentProfileInput, NewRun};

    async fn seed(store: &ForgeStore) -> (String, String, String) {
        let agent = store
            .create_agent(&AgentProfileInput {
                name: Some("lock-test".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let run = store
                .create_run(&NewRun {
                    agent_id: agent.id.clone(),
                    run_type: RunType::Manual,
                    dry_run: true,
                    scheduled_for: None,
                    max_iterations: 3,
                    batch_size: 10,
                    max_messages: 10,
                    metadata: serde_json::json!({}),
                })
                .await
                .unwrap();
            ids.push(run.id);
        }
        (agent.id, ids.remove(0), ids.remove(0))
    }

    #[tokio::test]
    async fn concurrent_acquire_has_exactly_one_winner() {
        let store = test_store();
        let (agent, a, b) = seed(&store).await;

        let (ra, rb) = tokio::join!(
            store.acquire_lock(&agent, &a, "runner"),
            store.acquire_lock(&agent, &b, "runner"),
        );
        let outcomes = [ra.unwrap(), rb.unwrap()];
        let winners = outcomes.iter().filter(|o| o.acquired).count();
        assert_eq!(winners, 1);
        let loser = outcomes.iter().find(|o| !o.acquired).unwrap();
        assert_eq!(loser.reason.as_deref(), Some("already_running"));
    }

    #[tokio::test]
    async fn acquire_flips_run_to_running() {
        let store = test_store();
        let (agent, a, _) = seed(&store).await;
        assert!(store.acquire_lock(&agent, &a, "runner").await.unwrap().acquired);

        let run = store.get_run(&a).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
        let profile = store.get_agent(&agent).await.unwrap().unwrap();
        assert_eq!(profile.status, AgentStatus::Running);
        assert_eq!(profile.lock_run_id.as_deref(), Some(a.as_str()));
    }

    #[tokio::test]
    async fn rejected_acquire_has_no_side_effects() {
        let store = test_store();
        let (agent, a, b) = seed(&store).await;
        store.acquire_lock(&agent, &a, "runner").await.unwrap();
        let outcome = store.acquire_lock(&agent, &b, "runner").await.unwrap();
        assert!(!outcome.acquired);

        let run_b = store.get_run(&b).await.unwrap().unwrap();
        assert_eq!(run_b.status, RunStatus::Queued);
        let profile = store.get_agent(&agent).await.unwrap().unwrap();
        assert_eq!(profile.lock_run_id.as_deref(), Some(a.as_str()));
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimable() {
        let store = test_store();
        let (agent, a, b) = seed(&store).await;
        store.acquire_lock(&agent, &a, "old-owner").await.unwrap();

        let old = Utc::now().timestamp_millis() - store.lock_ttl().as_millis() as i64 - 1_000;
        {
            let db = store.db.lock().await;
            db.execute(
                "UPDATE agent_profiles SET locked_at_ms = ?2 WHERE id = ?1",
                params![agent, old],
            )
            .unwrap();
        }

        let outcome = store.acquire_lock(&agent, &b, "new-owner").await.unwrap();
        assert!(outcome.acquired);
        let profile = store.get_agent(&agent).await.unwrap().unwrap();
        assert_eq!(profile.lock_run_id.as_deref(), Some(b.as_str()));
        assert_eq!(profile.lock_owner.as_deref(), Some("new-owner"));
    }

    #[tokio::test]
    async fn release_by_non_owner_is_ignored() {
        let store = test_store();
        let (agent, a, b) = seed(&store).await;
        store.acquire_lock(&agent, &a, "runner").await.unwrap();

        assert!(!store.release_lock(&agent, &b, AgentStatus::Active).await.unwrap());
        assert!(!store.refresh_lock(&agent, &b).await);
        let profile = store.get_agent(&agent).await.unwrap().unwrap();
        assert_eq!(profile.lock_run_id.as_deref(), Some(a.as_str()));

        assert!(store.refresh_lock(&agent, &a).await);
        assert!(store.release_lock(&agent, &a, AgentStatus::Active).await.unwrap());
        let profile = store.get_agent(&agent).await.unwrap().unwrap();
        assert!(profile.lock_run_id.is_none());
        assert!(profile.locked_at.is_none());
        assert_eq!(profile.status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn unknown_agent_is_rejected() {
        let store = test_store();
        let outcome = store.acquire_lock("missing", "run", "runner").await.unwrap();
        assert!(!outcome.acquired);
        assert_eq!(outcome.reason.as_deref(), Some("agent_not_found"));
    }
}
