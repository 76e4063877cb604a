//! Simulated conversations against a candidate patch, scored with the rubric.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::LazyLock;

use super::context::RunContext;
use super::error::ForgeResult;
use super::rubric::{CaseScore, RubricInput, score_case};
use super::types::{Phase, SelfTestCase};
use crate::core::llm::{ChatMessage, GenerationRequest};
use crate::core::store::now_ts;
use crate::core::store::types::{AgentProfile, EvaluationResult};

pub const MIN_CASES: usize = 5;
pub const MAX_REPLY_CHARS: usize = 600;
/// Share of cases (percent) that must pass for an iteration to pass.
pub const PASS_RATIO_PERCENT: usize = 80;

pub const FACTUAL_MISSING: &str = "factual_missing";
pub const HALLUCINATION: &str = "hallucination";
pub const TONE_MISMATCH: &str = "tone_mismatch";

static LONG_DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{10,}").expect("static regex"));

const PAYMENT_REPLY_TERMS: &[&str] = &["transfer", "cod", "cash on delivery", "bank", "payment", "pay"];
const SIZE_REPLY_TERMS: &[&str] = &["size", "cm", "inch", "xs", "xl", "xxl"];

fn case(id: &str, category: &str, script: &str) -> SelfTestCase {
    SelfTestCase {
        id: id.to_string(),
        category: category.to_string(),
        script: script.to_string(),
    }
}

/// Built-in scenarios used to top up a short panel, in fill order.
pub fn builtin_cases() -> Vec<SelfTestCase> {
    vec![
        case("fallback_price", "price", "Customer asks: how much is this dress?"),
        case(
            "fallback_missing_size",
            "size",
            "Customer wants to order a shirt but did not say which size.",
        ),
        case("fallback_payment", "payment", "Customer asks how they can pay for the order."),
        case("fallback_shipping", "shipping", "Customer asks when the parcel will be delivered."),
        case(
            "fallback_ghost_followup",
            "ghost_followup",
            "Customer went silent after receiving a quote yesterday; send a follow-up.",
        ),
    ]
}

/// The configured panel, topped up with built-ins (skipping ids already
/// present) until it holds at least [`MIN_CASES`].
pub fn ensure_minimum_panel(configured: &[SelfTestCase]) -> Vec<SelfTestCase> {
    let mut panel = configured.to_vec();
    for builtin in builtin_cases() {
        if panel.len() >= MIN_CASES {
            break;
        }
        if panel.iter().any(|c| c.id == builtin.id) {
            continue;
        }
        panel.push(builtin);
    }
    panel
}

fn is_payment_context(case: &SelfTestCase) -> bool {
    case.category == "payment" || case.script.to_lowercase().contains("pay")
}

fn is_size_context(case: &SelfTestCase) -> bool {
    case.category == "size" || case.script.to_lowercase().contains("size")
}

pub fn detect_violations(case: &SelfTestCase, reply: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let lower = reply.to_lowercase();
    if reply.trim().is_empty() {
        tags.push(FACTUAL_MISSING.to_string());
    }
    if LONG_DIGIT_RUN.is_match(reply) {
        tags.push(HALLUCINATION.to_string());
    }
    if is_payment_context(case) && !PAYMENT_REPLY_TERMS.iter().any(|t| lower.contains(t)) {
        tags.push(FACTUAL_MISSING.to_string());
    }
    if is_size_context(case) && !SIZE_REPLY_TERMS.iter().any(|t| lower.contains(t)) {
        tags.push(FACTUAL_MISSING.to_string());
    }
    if reply.chars().count() > MAX_REPLY_CHARS {
        tags.push(TONE_MISMATCH.to_string());
    }
    tags
}

/// Keyword reply used when no generation is available.
pub fn fallback_reply(case: &SelfTestCase) -> String {
    let script = case.script.to_lowercase();
    let reply = if is_payment_context(case) {
        "You can pay by bank transfer or cash on delivery (COD). Which payment method works best for you?"
    } else if is_size_context(case) {
        "Happy to help! Which size would you like (S, M, L or XL)? I can also share measurements in cm."
    } else if case.category == "price" || script.contains("how much") || script.contains("price") {
        "Thanks for asking! I will confirm the exact catalog price for the item you picked right away."
    } else if case.category == "shipping" || script.contains("deliver") || script.contains("ship") {
        "We ship with a tracked courier; delivery usually takes 2 to 3 business days after your order is confirmed."
    } else if case.category == "ghost_followup" {
        "Hi again! Just checking in on the quote we sent. Let me know if you have any questions, happy to help."
    } else {
        "Thanks for your message! Let me help you with that right away."
    };
    reply.to_string()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseOutcome {
    pub case_id: String,
    pub category: String,
    pub violations: Vec<String>,
    pub score: CaseScore,
    pub transcript: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfTestSummary {
    pub avg_score: f64,
    pub pass_count: usize,
    pub total_count: usize,
    pub passed: bool,
    pub critical_violations: Vec<String>,
}

/// Score a finished transcript.
pub fn evaluate_case(case: &SelfTestCase, reply: &str) -> CaseOutcome {
    let violations = detect_violations(case, reply);
    let assistant_turns = usize::from(!reply.trim().is_empty());
    let score = score_case(&RubricInput {
        user_turns: 1,
        assistant_turns,
        kb_violations: violations.iter().filter(|v| *v == FACTUAL_MISSING).count(),
        tone_mismatch: violations.iter().any(|v| v == TONE_MISMATCH),
        hallucination: violations.iter().any(|v| v == HALLUCINATION),
    });
    CaseOutcome {
        case_id: case.id.clone(),
        category: case.category.clone(),
        violations,
        score,
        transcript: json!([
            {"role": "user", "content": case.script},
            {"role": "assistant", "content": reply},
        ]),
    }
}

pub fn summarize(outcomes: &[CaseOutcome], baseline_score: f64) -> SelfTestSummary {
    let total = outcomes.len();
    let pass_count = outcomes.iter().filter(|o| o.score.passed).count();
    let avg = if total == 0 {
        0.0
    } else {
        let sum: f64 = outcomes.iter().map(|o| o.score.weighted_score).sum();
        (sum / total as f64 * 100.0).round() / 100.0
    };

    let mut critical = Vec::new();
    if total < MIN_CASES {
        critical.push("insufficient_cases".to_string());
    }
    if avg < baseline_score {
        critical.push("below_baseline".to_string());
    }
    if outcomes.iter().any(|o| o.violations.iter().any(|v| v == HALLUCINATION)) {
        critical.push(HALLUCINATION.to_string());
    }

    let passed = critical.is_empty() && total > 0 && pass_count * 100 >= total * PASS_RATIO_PERCENT;
    SelfTestSummary {
        avg_score: avg,
        pass_count,
        total_count: total,
        passed,
        critical_violations: critical,
    }
}

async fn simulate(
    ctx: &mut RunContext,
    profile: &AgentProfile,
    patch: &str,
    case: &SelfTestCase,
    iteration: u32,
) -> ForgeResult<(String, bool)> {
    let request = GenerationRequest {
        model: profile.customer_model.clone(),
        effort: None,
        input: vec![ChatMessage::system(patch), ChatMessage::user(case.script.clone())],
    };
    let turn_id = format!("selftest-{}-{}", iteration, case.id);
    Ok(match ctx.generate(&turn_id, request).await? {
        Some(response) => (response.text, false),
        None => (fallback_reply(case), true),
    })
}

/// Run the panel for one iteration. Every case is persisted as an
/// evaluation result; the stop marker is checked before each case.
pub async fn run_self_tests(
    ctx: &mut RunContext,
    profile: &AgentProfile,
    patch: &str,
    iteration: u32,
) -> ForgeResult<(Vec<CaseOutcome>, SelfTestSummary)> {
    let panel = ensure_minimum_panel(&profile.self_test_cases);
    let mut outcomes = Vec::with_capacity(panel.len());

    for case in &panel {
        ctx.checkpoint("self_test_case").await?;
        let (reply, fallback) = simulate(ctx, profile, patch, case, iteration).await?;
        let outcome = evaluate_case(case, &reply);

        ctx.store
            .record_evaluation(&EvaluationResult {
                run_id: ctx.run_id.clone(),
                iteration,
                case_id: outcome.case_id.clone(),
                category: outcome.category.clone(),
                scores: serde_json::to_value(outcome.score.scores).map_err(anyhow::Error::from)?,
                weighted_score: outcome.score.weighted_score,
                passed: outcome.score.passed,
                violations: outcome.violations.clone(),
                transcript: outcome.transcript.clone(),
                created_at: now_ts(),
            })
            .await?;
        ctx.emit(
            Phase::SelfTest,
            "self_test_case",
            json!({
                "iteration": iteration,
                "caseId": outcome.case_id,
                "weightedScore": outcome.score.weighted_score,
                "passed": outcome.score.passed,
                "violations": outcome.violations,
                "fallbackReply": fallback,
            }),
        )
        .await?;
        outcomes.push(outcome);
    }

    let summary = summarize(&outcomes, profile.baseline_score);
    ctx.emit(
        Phase::SelfTest,
        "self_test_summary",
        json!({"iteration": iteration, "summary": summary}),
    )
    .await?;
    Ok((outcomes, summary))
}
