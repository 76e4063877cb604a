use anyhow::Result;
use rusqlite::params;
use serde_json::Value;

use super::types::{DecisionJournalEntry, EvaluationResult};
use super::{ForgeStore, json_or_default, now_ts};
use crate::core::forge::types::Decision;

impl ForgeStore {
    /// Append the decision for one iteration. A second write for the same
    /// (run, iteration) is rejected by the unique index.
    pub async fn record_decision(
        &self,
        run_id: &str,
        iteration: u32,
        decision: Decision,
        reasoning: &str,
        action_plan: &Value,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO decision_journal (run_id, iteration, decision, reasoning, action_plan_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                iteration,
                decision.as_str(),
                reasoning,
                serde_json::to_string(action_plan)?,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_decisions(&self, run_id: &str) -> Result<Vec<DecisionJournalEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT run_id, iteration, decision, reasoning, action_plan_json, created_at
             FROM decision_journal WHERE run_id = ?1 ORDER BY iteration ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let plan: String = row.get(4)?;
            Ok(DecisionJournalEntry {
                run_id: row.get(0)?,
                iteration: row.get(1)?,
                decision: row.get(2)?,
                reasoning: row.get(3)?,
                action_plan: json_or_default(&plan),
                created_at: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn record_evaluation(&self, result: &EvaluationResult) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO evaluation_results (run_id, iteration, case_id, category, scores_json, weighted_score,
                passed, violations_json, transcript_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                result.run_id,
                result.iteration,
                result.case_id,
                result.category,
                serde_json::to_string(&result.scores)?,
                result.weighted_score,
                result.passed as i64,
                serde_json::to_string(&result.violations)?,
                serde_json::to_string(&result.transcript)?,
                result.created_at,
            ],
        )?;
        Ok(())
    }

    /// Evaluation results for a run, optionally restricted to one iteration.
    pub async fn list_evaluations(&self, run_id: &str, iteration: Option<u32>) -> Result<Vec<EvaluationResult>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT run_id, iteration, case_id, category, scores_json, weighted_score, passed,
                violations_json, transcript_json, created_at
             FROM evaluation_results
             WHERE run_id = ?1 AND (?2 IS NULL OR iteration = ?2)
             ORDER BY iteration ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![run_id, iteration], |row| {
            let scores: String = row.get(4)?;
            let violations: String = row.get(7)?;
            let transcript: String = row.get(8)?;
            Ok(EvaluationResult {
                run_id: row.get(0)?,
                iteration: row.get(1)?,
                case_id: row.get(2)?,
                category: row.get(3)?,
                scores: json_or_default(&scores),
                weighted_score: row.get(5)?,
                passed: row.get::<_, i64>(6)? != 0,
                violations: serde_json::from_str(&violations).unwrap_or_default(),
                transcript: json_or_default(&transcript),
                created_at: row.get(9)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
