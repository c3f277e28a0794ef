// =============================================================================
// Oracle reply parsing (part of C5)
// =============================================================================
//
// Three-stage recovery, matching the documented error-handling design:
//   1. Strip code fences, parse as JSON directly.
//   2. Normalize common offenders (smart quotes, exotic dashes, odd
//      whitespace) and retry.
//   3. Targeted regex extraction of the four required fields.
// If all three fail, the caller treats the reply as abandoned — no
// `DecisionLog` row is written, per "the oracle had nothing to say".
// =============================================================================

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Extract the assistant's raw text from an OpenAI-shaped chat-completions
/// response body. Falls back to `message.reasoning` when `content` is empty
/// and the model is reasoning-class, per the closed fallback rule.
pub fn extract_assistant_text(body: &Value, reasoning_class: bool) -> Option<(String, Option<String>)> {
    let choice = body.get("choices")?.as_array()?.first()?;
    let message = choice.get("message")?;
    let content = message.get("content").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
    let reasoning = message.get("reasoning").and_then(|v| v.as_str()).map(|s| s.to_string());

    if !content.is_empty() {
        return Some((content, reasoning));
    }
    if reasoning_class {
        if let Some(r) = &reasoning {
            if !r.trim().is_empty() {
                return Some((r.clone(), reasoning));
            }
        }
    }
    None
}

/// Strip a leading/trailing ```json ... ``` (or bare ``` ... ```) fence.
pub fn strip_code_fences(s: &str) -> String {
    let trimmed = s.trim();
    static FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^```(?:json)?\s*(.*?)\s*```$").unwrap());
    if let Some(caps) = FENCE.captures(trimmed) {
        caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_else(|| trimmed.to_string())
    } else {
        trimmed.to_string()
    }
}

/// Normalize common LLM-output offenders that break strict JSON parsing:
/// smart quotes, exotic dashes, non-breaking spaces.
pub fn normalize(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{2013}' | '\u{2014}' => '-',
            '\u{00A0}' => ' ',
            other => other,
        })
        .collect()
}

static OPERATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)"operation"\s*:\s*"(buy|sell|hold|close)""#).unwrap());
static SYMBOL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)"symbol"\s*:\s*"?([A-Za-z]{2,6})"?"#).unwrap());
static PORTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)"target_portion_of_balance"\s*:\s*([0-9]*\.?[0-9]+)"#).unwrap());
static REASON_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)"reason"\s*:\s*"([^"]*)""#).unwrap());

/// Regex-extract the four required fields directly out of reply text that
/// could not be parsed as JSON even after normalization. Returns `None` if
/// `operation` cannot be found — without it there is nothing to act on.
pub fn regex_extract(text: &str) -> Option<Value> {
    let operation = OPERATION_RE.captures(text)?.get(1)?.as_str().to_lowercase();
    let symbol = SYMBOL_RE.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str().to_uppercase());
    let portion: f64 = PORTION_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0.0);
    let reason = REASON_RE.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str().to_string()).unwrap_or_default();

    Some(serde_json::json!({
        "operation": operation,
        "symbol": symbol,
        "target_portion_of_balance": portion,
        "reason": reason,
        "trading_strategy": "",
    }))
}

/// Run the full three-stage recovery over raw assistant text, returning the
/// parsed JSON value or `None` if every stage failed.
pub fn parse_decision_json(raw_text: &str) -> Option<Value> {
    let stripped = strip_code_fences(raw_text);

    if let Ok(v) = serde_json::from_str::<Value>(&stripped) {
        return Some(v);
    }

    let normalized = normalize(&stripped);
    if let Ok(v) = serde_json::from_str::<Value>(&normalized) {
        return Some(v);
    }

    regex_extract(&normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_code_fence() {
        let s = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_code_fences(s), "{\"a\":1}");
    }

    #[test]
    fn normalize_converts_smart_quotes() {
        let s = "\u{201C}momentum\u{201D}";
        assert_eq!(normalize(s), "\"momentum\"");
    }

    #[test]
    fn parses_clean_json_directly() {
        let v = parse_decision_json(r#"{"operation":"hold","symbol":null,"target_portion_of_balance":0,"reason":"ok"}"#).unwrap();
        assert_eq!(v["operation"], "hold");
    }

    #[test]
    fn parses_after_smart_quote_normalization() {
        let raw = "```json\n{\"operation\":\"buy\",\"symbol\":\"ETH\",\"target_portion_of_balance\":0.1,\"reason\":\"\u{201C}momentum\u{201D}\"}\n```";
        let v = parse_decision_json(raw).unwrap();
        assert_eq!(v["operation"], "buy");
        assert_eq!(v["symbol"], "ETH");
    }

    #[test]
    fn regex_extraction_recovers_required_fields_from_broken_json() {
        let raw = r#"I think the best move is {"operation": "sell" "symbol": "SOL" "target_portion_of_balance": 0.5 "reason": "overextended"} sorry for the typo"#;
        let v = parse_decision_json(raw).unwrap();
        assert_eq!(v["operation"], "sell");
        assert_eq!(v["symbol"], "SOL");
        assert_eq!(v["target_portion_of_balance"], 0.5);
    }

    #[test]
    fn completely_unusable_text_returns_none() {
        assert!(parse_decision_json("the weather is nice today").is_none());
    }

    #[test]
    fn extract_assistant_text_prefers_content() {
        let body = serde_json::json!({"choices":[{"message":{"content":"hi","reasoning":"ignored"}}]});
        let (text, _) = extract_assistant_text(&body, true).unwrap();
        assert_eq!(text, "hi");
    }

    #[test]
    fn extract_assistant_text_falls_back_to_reasoning_for_reasoning_models() {
        let body = serde_json::json!({"choices":[{"message":{"content":"","reasoning":"thinking out loud"}}]});
        let (text, _) = extract_assistant_text(&body, true).unwrap();
        assert_eq!(text, "thinking out loud");
    }

    #[test]
    fn extract_assistant_text_does_not_fall_back_for_non_reasoning_models() {
        let body = serde_json::json!({"choices":[{"message":{"content":"","reasoning":"thinking out loud"}}]});
        assert!(extract_assistant_text(&body, false).is_none());
    }
}
