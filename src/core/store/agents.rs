use anyhow::{Result, bail};
use rusqlite::{OptionalExtension, Row, params};
use std::collections::BTreeSet;

use super::types::{AgentProfile, AgentProfileInput};
use super::{ForgeStore, from_ms, now_ts};
use crate::core::forge::types::{AgentMode, AgentStatus, SelfTestCase};

pub(crate) const AGENT_COLUMNS: &str = "id, name, mode, managed_sources_json, instruction_id, generation_model, \
     generation_effort, customer_model, cadence_days, evaluation_window_days, ghost_followup_hours, \
     compaction_trigger_tokens, baseline_score, max_iterations, self_tests_json, status, locked_at_ms, \
     lock_owner, lock_run_id, last_scheduled_run_date, created_at, updated_at";

pub(crate) fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<AgentProfile> {
    let mode: String = row.get(2)?;
    let sources_json: String = row.get(3)?;
    let tests_json: String = row.get(14)?;
    let status: String = row.get(15)?;
    Ok(AgentProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        mode: AgentMode::from_str_opt(&mode).unwrap_or(AgentMode::HumanOnly),
        managed_sources: serde_json::from_str(&sources_json).unwrap_or_default(),
        instruction_id: row.get(4)?,
        generation_model: row.get(5)?,
        generation_effort: row.get(6)?,
        customer_model: row.get(7)?,
        cadence_days: row.get(8)?,
        evaluation_window_days: row.get(9)?,
        ghost_followup_hours: row.get(10)?,
        compaction_trigger_tokens: row.get(11)?,
        baseline_score: row.get(12)?,
        max_iterations: row.get(13)?,
        self_test_cases: serde_json::from_str::<Vec<SelfTestCase>>(&tests_json).unwrap_or_default(),
        status: AgentStatus::from_str_opt(&status).unwrap_or(AgentStatus::Inactive),
        locked_at: from_ms(row.get(16)?),
        lock_owner: row.get(17)?,
        lock_run_id: row.get(18)?,
        last_scheduled_run_date: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

/// Validate and canonicalize managed source keys (`platform:id`): trimmed,
/// deduplicated, sorted so that order never matters.
pub fn normalize_sources(sources: &[String]) -> Result<Vec<String>> {
    let mut out = BTreeSet::new();
    for raw in sources {
        let key = raw.trim();
        let Some((platform, id)) = key.split_once(':') else {
            bail!("invalid source key '{}': expected platform:id", key);
        };
        if platform.trim().is_empty() || id.trim().is_empty() {
            bail!("invalid source key '{}': expected platform:id", key);
        }
        out.insert(format!("{}:{}", platform.trim().to_lowercase(), id.trim()));
    }
    Ok(out.into_iter().collect())
}

impl ForgeStore {
    pub async fn create_agent(&self, input: &AgentProfileInput) -> Result<AgentProfile> {
        let name = input
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| anyhow::anyhow!("name is required"))?
            .to_string();
        if matches!(input.status, Some(AgentStatus::Running)) {
            bail!("status 'running' is reserved for the run lock");
        }
        let sources = normalize_sources(input.managed_sources.as_deref().unwrap_or(&[]))?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agent_profiles (id, name, mode, managed_sources_json, instruction_id, generation_model,
                generation_effort, customer_model, cadence_days, evaluation_window_days, ghost_followup_hours,
                compaction_trigger_tokens, baseline_score, max_iterations, self_tests_json, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
            params![
                id,
                name,
                input.mode.unwrap_or(AgentMode::HumanOnly).as_str(),
                serde_json::to_string(&sources)?,
                input.instruction_id,
                input.generation_model.clone().unwrap_or_else(|| "o3-mini".to_string()),
                input.generation_effort.clone().unwrap_or_else(|| "medium".to_string()),
                input.customer_model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
                input.cadence_days.unwrap_or(1).max(1),
                input.evaluation_window_days.unwrap_or(7).max(1),
                input.ghost_followup_hours.unwrap_or(24).max(1),
                input.compaction_trigger_tokens.unwrap_or(220_000).max(1),
                input.baseline_score.unwrap_or(80.0),
                input.max_iterations.unwrap_or(3).max(1),
                serde_json::to_string(input.self_test_cases.as_deref().unwrap_or(&[]))?,
                input.status.unwrap_or(AgentStatus::Active).as_str(),
                now,
            ],
        )?;
        let profile = db.query_row(
            &format!("SELECT {} FROM agent_profiles WHERE id = ?1", AGENT_COLUMNS),
            params![id],
            row_to_profile,
        )?;
        Ok(profile)
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentProfile>> {
        let db = self.db.lock().await;
        let profile = db
            .query_row(
                &format!("SELECT {} FROM agent_profiles WHERE id = ?1", AGENT_COLUMNS),
                params![agent_id],
                row_to_profile,
            )
            .optional()?;
        Ok(profile)
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentProfile>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM agent_profiles ORDER BY created_at ASC",
            AGENT_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_profile)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Apply a partial configuration update. Lock fields are never touched
    /// here; status may only move between `active` and `inactive`, and not
    /// while a run holds the lock.
    pub async fn update_agent(
        &self,
        agent_id: &str,
        input: &AgentProfileInput,
    ) -> Result<Option<AgentProfile>> {
        let Some(current) = self.get_agent(agent_id).await? else {
            return Ok(None);
        };
        if let Some(status) = input.status {
            if status == AgentStatus::Running {
                bail!("status 'running' is reserved for the run lock");
            }
            if current.lock_run_id.is_some() {
                bail!("agent is running; status can change after the run releases its lock");
            }
        }
        let sources = match &input.managed_sources {
            Some(s) => normalize_sources(s)?,
            None => current.managed_sources.clone(),
        };
        let name = input
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or(current.name);
        let self_tests = input
            .self_test_cases
            .clone()
            .unwrap_or(current.self_test_cases);

        let db = self.db.lock().await;
        db.execute(
            "UPDATE agent_profiles SET name = ?2, mode = ?3, managed_sources_json = ?4, instruction_id = ?5,
                generation_model = ?6, generation_effort = ?7, customer_model = ?8, cadence_days = ?9,
                evaluation_window_days = ?10, ghost_followup_hours = ?11, compaction_trigger_tokens = ?12,
                baseline_score = ?13, max_iterations = ?14, self_tests_json = ?15,
                status = COALESCE(?16, status), updated_at = ?17
             WHERE id = ?1",
            params![
                agent_id,
                name,
                input.mode.unwrap_or(current.mode).as_str(),
                serde_json::to_string(&sources)?,
                input.instruction_id.clone().or(current.instruction_id),
                input.generation_model.clone().unwrap_or(current.generation_model),
                input.generation_effort.clone().unwrap_or(current.generation_effort),
                input.customer_model.clone().unwrap_or(current.customer_model),
                input.cadence_days.unwrap_or(current.cadence_days).max(1),
                input
                    .evaluation_window_days
                    .unwrap_or(current.evaluation_window_days)
                    .max(1),
                input
                    .ghost_followup_hours
                    .unwrap_or(current.ghost_followup_hours)
                    .max(1),
                input
                    .compaction_trigger_tokens
                    .unwrap_or(current.compaction_trigger_tokens)
                    .max(1),
                input.baseline_score.unwrap_or(current.baseline_score),
                input.max_iterations.unwrap_or(current.max_iterations).max(1),
                serde_json::to_string(&self_tests)?,
                input.status.map(|s| s.as_str()),
                now_ts(),
            ],
        )?;
        let profile = db.query_row(
            &format!("SELECT {} FROM agent_profiles WHERE id = ?1", AGENT_COLUMNS),
            params![agent_id],
            row_to_profile,
        )?;
        Ok(Some(profile))
    }

    pub async fn set_agent_mode(&self, agent_id: &str, mode: AgentMode) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE agent_profiles SET mode = ?2, updated_at = ?3 WHERE id = ?1",
            params![agent_id, mode.as_str(), now_ts()],
        )?;
        Ok(rows > 0)
    }

    /// Record the calendar date (`YYYY-MM-DD`) a scheduled run was started for.
    pub async fn mark_scheduled(&self, agent_id: &str, date: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE agent_profiles SET last_scheduled_run_date = ?2, updated_at = ?3 WHERE id = ?1",
            params![agent_id, date, now_ts()],
        )?;
        Ok(rows > 0)
    }
}
