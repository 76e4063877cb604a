//! Payload redaction applied before anything reaches the event log or the
//! readable half of a generation snapshot.

use serde_json::Value;

const SENSITIVE_WORDS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passwd",
    "authorization",
    "cookie",
    "phone",
    "mobile",
    "tel",
    "telephone",
    "address",
    "email",
];

const SENSITIVE_COMPOUNDS: &[&str] = &["apikey", "password", "passwd", "accesstoken"];

const MASK: &str = "****";

/// Partial reveal: first two and last two characters around a fixed mask.
/// Values of four characters or fewer are masked entirely.
pub fn mask_text(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return MASK.to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, MASK, tail)
}

/// Split `phoneNumber`, `api_key`, `X-Auth-Token` style keys into lowercase
/// words and match them against the sensitive vocabulary. Plural forms such as
/// `totalTokens` are deliberately not matched.
pub fn is_sensitive_key(key: &str) -> bool {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in key.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }

    if words.iter().any(|w| SENSITIVE_WORDS.contains(&w.as_str())) {
        return true;
    }
    let joined = words.concat();
    SENSITIVE_COMPOUNDS.iter().any(|c| joined.contains(c))
}

/// Recursively redact every value stored under a sensitive key, including
/// everything nested beneath it.
pub fn mask_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = if is_sensitive_key(k) {
                        mask_all(v)
                    } else {
                        mask_payload(v)
                    };
                    (k.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_payload).collect()),
        other => other.clone(),
    }
}

fn mask_all(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(mask_text(s)),
        Value::Number(n) => Value::String(mask_text(&n.to_string())),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), mask_all(v))).collect()),
        Value::Array(items) => Value::Array(items.iter().map(mask_all).collect()),
        Value::Bool(_) | Value::Null => value.clone(),
    }
}
