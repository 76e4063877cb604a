//! Fixed scoring rubric for one simulated self-test case.

use serde::Serialize;

pub const WEIGHT_TASK_COMPLETION: f64 = 30.0;
pub const WEIGHT_FACTUAL_ACCURACY: f64 = 25.0;
pub const WEIGHT_TONE_FIT: f64 = 15.0;
pub const WEIGHT_RESPONSE_EFFICIENCY: f64 = 10.0;
pub const WEIGHT_NO_HALLUCINATION: f64 = 20.0;

pub const PASS_THRESHOLD: f64 = 80.0;

#[derive(Debug, Clone, Default)]
pub struct RubricInput {
    pub user_turns: usize,
    pub assistant_turns: usize,
    /// Knowledge-base violations only (`factual_missing`).
    pub kb_violations: usize,
    pub tone_mismatch: bool,
    pub hallucination: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricScores {
    pub task_completion: f64,
    pub factual_accuracy: f64,
    pub tone_fit: f64,
    pub response_efficiency: f64,
    pub no_hallucination: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseScore {
    pub scores: RubricScores,
    pub weighted_score: f64,
    pub passed: bool,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn score_case(input: &RubricInput) -> CaseScore {
    let scores = RubricScores {
        task_completion: if input.user_turns > 0 && input.assistant_turns > 0 {
            85.0
        } else {
            40.0
        },
        factual_accuracy: (100.0 - 30.0 * input.kb_violations as f64).max(0.0),
        tone_fit: if input.tone_mismatch { 60.0 } else { 90.0 },
        response_efficiency: if input.assistant_turns <= input.user_turns + 1 {
            90.0
        } else {
            70.0
        },
        no_hallucination: if input.hallucination { 0.0 } else { 100.0 },
    };

    let weighted = [
        (scores.task_completion, WEIGHT_TASK_COMPLETION),
        (scores.factual_accuracy, WEIGHT_FACTUAL_ACCURACY),
        (scores.tone_fit, WEIGHT_TONE_FIT),
        (scores.response_efficiency, WEIGHT_RESPONSE_EFFICIENCY),
        (scores.no_hallucination, WEIGHT_NO_HALLUCINATION),
    ];
    let total_weight: f64 = weighted.iter().map(|(_, w)| w).sum();
    let sum: f64 = weighted.iter().map(|(s, w)| s * w).sum();
    let weighted_score = round2(sum / total_weight);

    // Factual accuracy and hallucination are hard gates.
    let passed = weighted_score >= PASS_THRESHOLD
        && scores.factual_accuracy >= 100.0
        && !input.hallucination;

    CaseScore {
        scores,
        weighted_score,
        passed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean() -> RubricInput {
        RubricInput {
            user_turns: 1,
            assistant_turns: 1,
            ..Default::default()
        }
    }

    #[test]
    fn clean_exchange_scores_93() {
        let score = score_case(&clean());
        assert_eq!(score.weighted_score, 93.0);
        assert!(score.passed);
    }

    #[test]
    fn factual_violation_never_passes() {
        let score = score_case(&RubricInput {
            kb_violations: 1,
            ..clean()
        });
        assert_eq!(score.scores.factual_accuracy, 70.0);
        // 85*30 + 70*25 + 90*15 + 90*10 + 100*20 = 8550 -> 85.5
        assert_eq!(score.weighted_score, 85.5);
        assert!(!score.passed);
    }

    #[test]
    fn hallucination_zeroes_subscore_and_fails() {
        let score = score_case(&RubricInput {
            hallucination: true,
            ..clean()
        });
        assert_eq!(score.scores.no_hallucination, 0.0);
        assert!(!score.passed);
    }

    #[test]
    fn factual_accuracy_floors_at_zero() {
        let score = score_case(&RubricInput {
            kb_violations: 5,
            ..clean()
        });
        assert_eq!(score.scores.factual_accuracy, 0.0);
    }

    #[test]
    fn missing_reply_lowers_task_completion() {
        let score = score_case(&RubricInput {
            user_turns: 1,
            assistant_turns: 0,
            ..Default::default()
        });
        assert_eq!(score.scores.task_completion, 40.0);
        assert!(!score.passed);
    }

    #[test]
    fn tone_and_efficiency_penalties() {
        let score = score_case(&RubricInput {
            user_turns: 1,
            assistant_turns: 3,
            tone_mismatch: true,
            ..Default::default()
        });
        assert_eq!(score.scores.tone_fit, 60.0);
        assert_eq!(score.scores.response_efficiency, 70.0);
        // 2550 + 2500 + 900 + 700 + 2000 = 8650 -> 86.5
        assert_eq!(score.weighted_score, 86.5);
        assert!(score.passed);
    }
}
