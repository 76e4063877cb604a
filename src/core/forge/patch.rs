//! Candidate patch generation and refinement, each with a deterministic
//! fallback for when the generation capability is unavailable.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::context::RunContext;
use super::error::ForgeResult;
use super::history::Insight;
use super::types::Phase;
use crate::core::llm::{ChatMessage, GenerationRequest};
use crate::core::store::types::AgentProfile;

const PRICE_TERMS: &[&str] = &["price", "how much", "cost", "ราคา", "เท่าไหร่", "เท่าไร"];
const SHIPPING_TERMS: &[&str] = &["ship", "delivery", "deliver", "courier", "ส่ง", "kerry"];
const PAYMENT_TERMS: &[&str] = &["pay", "transfer", "bank", "cash on delivery", "โอน", "ปลายทาง"];
const ORDER_TERMS: &[&str] = &["order", "buy", "purchase", "สั่ง", "ซื้อ"];
const ORDER_FIELD_TERMS: &[&str] = &["size", "address", "phone", "ไซส์", "ที่อยู่", "เบอร์"];

const SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestCounters {
    pub price_questions: u32,
    pub shipping_questions: u32,
    pub payment_questions: u32,
    pub incomplete_order_fields: u32,
    pub ghost_signals: u32,
}

/// Heuristic summary of ingested conversations, carried in the
/// `history_complete` checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightDigest {
    pub conversations: usize,
    pub counters: DigestCounters,
    pub samples: Vec<String>,
}

fn mentions(text: &str, terms: &[&str]) -> bool {
    terms.iter().any(|t| text.contains(t))
}

impl InsightDigest {
    pub fn from_insights(insights: &[Insight], ghost_followup_hours: i64, now: DateTime<Utc>) -> Self {
        let mut counters = DigestCounters::default();
        let mut samples = Vec::new();
        let ghost_after = Duration::hours(ghost_followup_hours.max(1));

        for insight in insights {
            let text = insight.customer_text.to_lowercase();
            if mentions(&text, PRICE_TERMS) {
                counters.price_questions += 1;
            }
            if mentions(&text, SHIPPING_TERMS) {
                counters.shipping_questions += 1;
            }
            if mentions(&text, PAYMENT_TERMS) {
                counters.payment_questions += 1;
            }
            if mentions(&text, ORDER_TERMS) && !mentions(&text, ORDER_FIELD_TERMS) {
                counters.incomplete_order_fields += 1;
            }
            if insight.last_role == "assistant" && now - insight.last_message_at >= ghost_after {
                counters.ghost_signals += 1;
            }
            if samples.len() < SAMPLE_LIMIT && !insight.customer_text.is_empty() {
                samples.push(insight.customer_text.chars().take(160).collect());
            }
        }

        Self {
            conversations: insights.len(),
            counters,
            samples,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedCase {
    pub case_id: String,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOrigin {
    Generation,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchDraft {
    pub text: String,
    pub origin: PatchOrigin,
}

pub fn fallback_patch(digest: &InsightDigest) -> String {
    let c = &digest.counters;
    format!(
        "## Agent Forge auto-summary\n\
         Conversations reviewed: {}\n\
         - Price questions: {}\n\
         - Shipping questions: {}\n\
         - Payment questions: {}\n\
         - Orders missing required fields: {}\n\
         - Silent customers after a reply: {}\n\
         \n\
         Directives:\n\
         1. When asked about price, state the exact catalog price before anything else.\n\
         2. Explain the shipping carrier and expected delivery time.\n\
         3. Offer the defined payment methods: bank transfer or cash on delivery (COD).\n\
         4. Before confirming an order, collect size, quantity, name, shipping address and phone.\n\
         5. Follow up once, politely, with customers who went silent after a quote.",
        digest.conversations,
        c.price_questions,
        c.shipping_questions,
        c.payment_questions,
        c.incomplete_order_fields,
        c.ghost_signals,
    )
}

pub fn fallback_refinement(previous: &str, failed: &[FailedCase], iteration: u32) -> String {
    let addressed = if failed.is_empty() {
        "none".to_string()
    } else {
        failed
            .iter()
            .map(|f| format!("{} ({})", f.case_id, f.violations.join(", ")))
            .collect::<Vec<_>>()
            .join("; ")
    };
    format!(
        "{}\n\n### Guardrails (iteration {})\n\
         - Never invent prices, stock levels, tracking or order numbers; say you will check.\n\
         - When payment comes up, name the accepted methods: bank transfer or cash on delivery.\n\
         - When size comes up, ask for or confirm the size (S/M/L/XL or cm).\n\
         - Keep every reply short, under 600 characters.\n\
         - Cases addressed: {}",
        previous.trim_end(),
        iteration,
        addressed
    )
}

const PATCH_SYSTEM_PROMPT: &str = "You improve the behavioral instructions of a customer-service chat agent. \
Return only the instruction block text, in Markdown, with no preamble.";

/// Propose an instruction patch from the current instruction and the digest.
pub async fn generate_patch(
    ctx: &mut RunContext,
    profile: &AgentProfile,
    instruction_context: &str,
    digest: &InsightDigest,
) -> ForgeResult<PatchDraft> {
    ctx.checkpoint("patch_generate").await?;
    let request = GenerationRequest {
        model: profile.generation_model.clone(),
        effort: Some(profile.generation_effort.clone()),
        input: vec![
            ChatMessage::system(PATCH_SYSTEM_PROMPT),
            ChatMessage::user(
                json!({
                    "task": "propose_patch",
                    "currentInstruction": instruction_context,
                    "insights": digest,
                })
                .to_string(),
            ),
        ],
    };

    let draft = match ctx.generate("patch-1", request).await? {
        Some(response) => PatchDraft {
            text: response.text.trim().to_string(),
            origin: PatchOrigin::Generation,
        },
        None => PatchDraft {
            text: fallback_patch(digest),
            origin: PatchOrigin::Fallback,
        },
    };
    ctx.emit(
        Phase::Patch,
        "patch_generated",
        json!({"origin": draft.origin, "chars": draft.text.chars().count()}),
    )
    .await?;
    Ok(draft)
}

/// Revise a patch given the cases that failed the last iteration.
pub async fn refine_patch(
    ctx: &mut RunContext,
    profile: &AgentProfile,
    previous: &str,
    failed: &[FailedCase],
    iteration: u32,
) -> ForgeResult<PatchDraft> {
    ctx.checkpoint("patch_refine").await?;
    let request = GenerationRequest {
        model: profile.generation_model.clone(),
        effort: Some(profile.generation_effort.clone()),
        input: vec![
            ChatMessage::system(PATCH_SYSTEM_PROMPT),
            ChatMessage::user(
                json!({
                    "task": "refine_patch",
                    "iteration": iteration,
                    "previousPatch": previous,
                    "failedCases": failed,
                })
                .to_string(),
            ),
        ],
    };

    let turn_id = format!("patch-{}", iteration);
    let draft = match ctx.generate(&turn_id, request).await? {
        Some(response) => PatchDraft {
            text: response.text.trim().to_string(),
            origin: PatchOrigin::Generation,
        },
        None => PatchDraft {
            text: fallback_refinement(previous, failed, iteration),
            origin: PatchOrigin::Fallback,
        },
    };
    ctx.emit(
        Phase::Patch,
        "patch_refined",
        json!({
            "iteration": iteration,
            "origin": draft.origin,
            "failedCases": failed.iter().map(|f| &f.case_id).collect::<Vec<_>>(),
        }),
    )
    .await?;
    Ok(draft)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn insight(text: &str, last_role: &str, hours_ago: i64, now: DateTime<Utc>) -> Insight {
        Insight {
            source: "facebook:1".into(),
            counterparty_id: format!("cp-{}", text.len()),
            customer_text: text.into(),
            last_role: last_role.into(),
            last_message_at: now - Duration::hours(hours_ago),
            turns: 2,
        }
    }

    #[test]
    fn digest_counts_signals() {
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        let insights = vec![
            insight("How much is the red dress?", "user", 1, now),
            insight("I want to order two", "assistant", 30, now),
            insight("Can I pay by bank transfer? when will you ship", "user", 2, now),
            insight("order please, size M, address 12 Silom", "user", 1, now),
        ];
        let digest = InsightDigest::from_insights(&insights, 24, now);
        assert_eq!(digest.conversations, 4);
        assert_eq!(digest.counters.price_questions, 1);
        assert_eq!(digest.counters.payment_questions, 1);
        assert_eq!(digest.counters.shipping_questions, 1);
        assert_eq!(digest.counters.incomplete_order_fields, 1);
        assert_eq!(digest.counters.ghost_signals, 1);
        assert_eq!(digest.samples.len(), 4);
    }

    #[test]
    fn fallback_patch_lists_counters_and_directives() {
        let digest = InsightDigest {
            conversations: 3,
            counters: DigestCounters {
                price_questions: 2,
                ..Default::default()
            },
            samples: vec![],
        };
        let text = fallback_patch(&digest);
        assert!(text.starts_with("## Agent Forge auto-summary"));
        assert!(text.contains("Price questions: 2"));
        assert!(text.contains("5. Follow up once"));
    }

    #[test]
    fn fallback_refinement_keeps_previous_text() {
        let failed = vec![FailedCase {
            case_id: "fallback_payment".into(),
            violations: vec!["factual_missing".into()],
        }];
        let text = fallback_refinement("base patch", &failed, 2);
        assert!(text.starts_with("base patch"));
        assert!(text.contains("### Guardrails (iteration 2)"));
        assert!(text.contains("fallback_payment (factual_missing)"));
    }
}
