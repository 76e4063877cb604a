use serde::Serialize;

use super::selftest::SelfTestSummary;
use super::types::Decision;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub reasoning: String,
}

/// Pure stop/continue policy for one evaluated iteration.
pub fn decide(
    iteration: u32,
    max_iterations: u32,
    summary: &SelfTestSummary,
    baseline_score: f64,
) -> DecisionOutcome {
    if summary.passed && summary.critical_violations.is_empty() && summary.avg_score >= baseline_score {
        return DecisionOutcome {
            decision: Decision::StopPass,
            reasoning: format!(
                "iteration {}: {}/{} cases passed, average {:.2} meets baseline {:.2}",
                iteration, summary.pass_count, summary.total_count, summary.avg_score, baseline_score
            ),
        };
    }

    let why = if summary.critical_violations.is_empty() {
        format!(
            "{}/{} cases passed, average {:.2} against baseline {:.2}",
            summary.pass_count, summary.total_count, summary.avg_score, baseline_score
        )
    } else {
        format!(
            "critical violations [{}], average {:.2} against baseline {:.2}",
            summary.critical_violations.join(", "),
            summary.avg_score,
            baseline_score
        )
    };

    if iteration >= max_iterations {
        DecisionOutcome {
            decision: Decision::StopFail,
            reasoning: format!(
                "iteration {} of {}: budget exhausted; {}",
                iteration, max_iterations, why
            ),
        }
    } else {
        DecisionOutcome {
            decision: Decision::Continue,
            reasoning: format!("iteration {} of {}: refining; {}", iteration, max_iterations, why),
        }
    }
}
