// =============================================================================
// Oracle client (part of C5)
// =============================================================================
//
// POSTs the rendered prompt to one of a small, ordered list of endpoints
// derived from the account's base URL, retrying each with exponential
// backoff + jitter on 429/transport errors before falling through to the
// next endpoint. Parameter selection differs for reasoning-class models
// (gpt-5*, o1*, o3*, o4*), which use `max_completion_tokens` and omit
// `temperature`; `gpt-4o*` also uses `max_completion_tokens` but keeps
// `temperature`, matching the source system's model-family table.
// =============================================================================

use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::db::models::Account;
use crate::errors::{OracleError, OracleResult};

use super::parse::extract_assistant_text;

/// Whether `model` belongs to the "reasoning-class" family that forbids
/// `temperature`, uses `max_completion_tokens`, and (for gpt-5*) sets
/// `reasoning_effort`.
pub fn is_reasoning_class(model: &str) -> bool {
    let m = model.to_lowercase();
    m.starts_with("gpt-5") || m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4")
}

/// `o1` forbids a system-role message entirely.
pub fn forbids_system_role(model: &str) -> bool {
    model.to_lowercase().starts_with("o1")
}

fn uses_max_completion_tokens(model: &str) -> bool {
    let m = model.to_lowercase();
    is_reasoning_class(&m) || m.starts_with("gpt-4o")
}

/// Build the ordered list of chat-completions endpoints to try for this
/// account's base URL:
///   - always `{base}/chat/completions`
///   - if the host contains `deepseek.com`, also try the `/v1/...` variant
///     (added or stripped depending on whether `base` already ends `/v1`)
///   - if `base` ends in `/openai/v1` (Azure OpenAI shape), only the single
///     primary endpoint is tried
pub fn build_chat_completion_endpoints(base_url: &str) -> Vec<String> {
    let trimmed = base_url.trim_end_matches('/');
    let primary = format!("{trimmed}/chat/completions");

    if trimmed.ends_with("/openai/v1") {
        return vec![primary];
    }

    let mut endpoints = vec![primary];
    if trimmed.contains("deepseek.com") {
        let alt_base = if let Some(stripped) = trimmed.strip_suffix("/v1") {
            stripped.to_string()
        } else {
            format!("{trimmed}/v1")
        };
        endpoints.push(format!("{alt_base}/chat/completions"));
    }
    endpoints
}

fn build_payload(account: &Account, prompt: &str, timeout_secs: u64) -> Value {
    let model = &account.oracle_model;
    let mut messages = Vec::new();
    if !forbids_system_role(model) {
        messages.push(json!({"role": "system", "content": "You are a disciplined crypto trading assistant. Reply with JSON only."}));
    }
    messages.push(json!({"role": "user", "content": prompt}));

    let mut payload = json!({
        "model": model,
        "messages": messages,
    });

    let obj = payload.as_object_mut().expect("payload is an object");
    if uses_max_completion_tokens(model) {
        obj.insert("max_completion_tokens".to_string(), json!(1024));
    } else {
        obj.insert("max_tokens".to_string(), json!(1024));
        obj.insert("temperature".to_string(), json!(0.7));
    }
    if is_reasoning_class(model) && model.to_lowercase().starts_with("gpt-5") {
        obj.insert("reasoning_effort".to_string(), json!("medium"));
    }
    let _ = timeout_secs; // per-attempt timeout is enforced by the HTTP client, not the payload
    payload
}

pub struct OracleClient {
    http: Client,
    max_retries: u32,
    backoff_base: Duration,
    timeout: Duration,
}

impl OracleClient {
    pub fn new(verify_tls: bool, timeout: Duration, max_retries: u32, backoff_base: Duration) -> Self {
        let http = Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        if !verify_tls {
            warn!("oracle TLS verification disabled (ENABLE_SSL_VERIFICATION=false)");
        }
        Self {
            http,
            max_retries,
            backoff_base,
            timeout,
        }
    }

    /// Call the oracle for `account` with `prompt`, trying each fallback
    /// endpoint in order. Returns the assistant's raw text and, if present,
    /// a separate reasoning text. Gives up with `OracleError` only after
    /// every endpoint has been exhausted.
    pub async fn call(&self, account: &Account, prompt: &str) -> OracleResult<(String, Option<String>)> {
        let endpoints = build_chat_completion_endpoints(&account.oracle_base_url);
        let payload = build_payload(account, prompt, self.timeout.as_secs());
        let reasoning_class = is_reasoning_class(&account.oracle_model);

        let mut last_err = OracleError::AllEndpointsExhausted;

        for endpoint in &endpoints {
            match self.call_endpoint_with_retries(endpoint, &account.oracle_api_key, &payload, reasoning_class).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(endpoint, error = %e, "oracle endpoint exhausted, falling through");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn call_endpoint_with_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
        reasoning_class: bool,
    ) -> OracleResult<(String, Option<String>)> {
        for attempt in 0..self.max_retries {
            let resp = self
                .http
                .post(endpoint)
                .bearer_auth(api_key)
                .json(payload)
                .send()
                .await;

            match resp {
                Ok(r) if r.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    self.sleep_backoff(attempt).await;
                    continue;
                }
                Ok(r) if r.status().is_success() => {
                    let body: Value = r
                        .json()
                        .await
                        .map_err(|e| OracleError::Transport(e.to_string()))?;
                    if let Some(reason) = body.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("finish_reason")).and_then(|v| v.as_str()) {
                        if reason == "length" {
                            info!(endpoint, "oracle reply truncated (finish_reason=length)");
                        }
                    }
                    return extract_assistant_text(&body, reasoning_class).ok_or(OracleError::MalformedReply);
                }
                Ok(_r) => {
                    // Any other non-2xx aborts this endpoint and falls through.
                    return Err(OracleError::Transport("non-success status".to_string()));
                }
                Err(e) => {
                    if e.is_timeout() || e.is_connect() {
                        self.sleep_backoff(attempt).await;
                        continue;
                    }
                    return Err(OracleError::Transport(e.to_string()));
                }
            }
        }
        Err(OracleError::Transport(format!("exhausted {} retries", self.max_retries)))
    }

    async fn sleep_backoff(&self, attempt: u32) {
        let base = self.backoff_base.as_secs_f64() * 2f64.powi(attempt as i32);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..base.max(0.05));
        tokio::time::sleep(Duration::from_secs_f64(base + jitter)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_class_matches_expected_prefixes() {
        assert!(is_reasoning_class("gpt-5"));
        assert!(is_reasoning_class("gpt-5-mini"));
        assert!(is_reasoning_class("o1-preview"));
        assert!(is_reasoning_class("o1-mini"));
        assert!(is_reasoning_class("o3-mini"));
        assert!(is_reasoning_class("o4-mini"));
        assert!(!is_reasoning_class("gpt-4o"));
        assert!(!is_reasoning_class("gpt-4o-mini"));
    }

    #[test]
    fn o1_forbids_system_role_but_o3_does_not() {
        assert!(forbids_system_role("o1-preview"));
        assert!(!forbids_system_role("o3-mini"));
    }

    #[test]
    fn default_endpoint_is_chat_completions() {
        let endpoints = build_chat_completion_endpoints("https://api.openai.com/v1");
        assert_eq!(endpoints, vec!["https://api.openai.com/v1/chat/completions"]);
    }

    #[test]
    fn deepseek_base_gets_an_alternate_v1_endpoint() {
        let endpoints = build_chat_completion_endpoints("https://api.deepseek.com");
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints[1].ends_with("/v1/chat/completions"));
    }

    #[test]
    fn deepseek_base_already_ending_v1_strips_it_for_the_alternate() {
        let endpoints = build_chat_completion_endpoints("https://api.deepseek.com/v1");
        assert_eq!(endpoints.len(), 2);
        assert!(!endpoints[1].contains("/v1/chat/completions"));
    }

    #[test]
    fn azure_shaped_base_only_tries_one_endpoint() {
        let endpoints = build_chat_completion_endpoints("https://my-resource.openai.azure.com/openai/v1");
        assert_eq!(endpoints.len(), 1);
    }

    #[test]
    fn gpt4o_payload_keeps_temperature_but_uses_max_completion_tokens() {
        let account = Account {
            id: crate::types::AccountId(0),
            name: "a".into(),
            active: true,
            auto_trading: true,
            broker_api_key: None,
            broker_secret_key: None,
            oracle_base_url: "https://api.openai.com/v1".into(),
            oracle_api_key: "sk-x".into(),
            oracle_model: "gpt-4o".into(),
            created_at: "now".into(),
        };
        let payload = build_payload(&account, "prompt", 30);
        assert!(payload.get("max_completion_tokens").is_some());
        assert!(payload.get("temperature").is_some());
        assert!(payload.get("max_tokens").is_none());
    }

    #[test]
    fn reasoning_model_payload_omits_temperature() {
        let account = Account {
            id: crate::types::AccountId(0),
            name: "a".into(),
            active: true,
            auto_trading: true,
            broker_api_key: None,
            broker_secret_key: None,
            oracle_base_url: "https://api.openai.com/v1".into(),
            oracle_api_key: "sk-x".into(),
            oracle_model: "gpt-5".into(),
            created_at: "now".into(),
        };
        let payload = build_payload(&account, "prompt", 30);
        assert!(payload.get("temperature").is_none());
        assert_eq!(payload["reasoning_effort"], "medium");
    }

    #[test]
    fn o1_payload_has_no_system_message() {
        let account = Account {
            id: crate::types::AccountId(0),
            name: "a".into(),
            active: true,
            auto_trading: true,
            broker_api_key: None,
            broker_secret_key: None,
            oracle_base_url: "https://api.openai.com/v1".into(),
            oracle_api_key: "sk-x".into(),
            oracle_model: "o1-preview".into(),
            created_at: "now".into(),
        };
        let payload = build_payload(&account, "prompt", 30);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }
}
