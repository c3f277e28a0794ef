// =============================================================================
// Persisted row types
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{AccountId, TriggerMode};

/// A trading account. The unit of isolation across the whole engine: no
/// component may blend decisions, balances, or triggers across accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub active: bool,
    pub auto_trading: bool,
    pub broker_api_key: Option<String>,
    pub broker_secret_key: Option<String>,
    pub oracle_base_url: String,
    pub oracle_api_key: String,
    pub oracle_model: String,
    pub created_at: String,
}

/// Placeholder oracle API keys that mean "not configured" — accounts using
/// one of these are skipped by the trigger engine entirely rather than
/// attempted and failed.
const DEMO_ORACLE_KEYS: &[&str] = &["default-key-please-update-in-settings", "default", ""];

impl Account {
    /// Whether this account has a real oracle API key configured.
    pub fn is_oracle_configured(&self) -> bool {
        !DEMO_ORACLE_KEYS.contains(&self.oracle_api_key.as_str())
    }

    /// Whether this account has broker credentials configured.
    pub fn has_broker_credentials(&self) -> bool {
        self.broker_api_key.as_deref().is_some_and(|s| !s.is_empty())
            && self.broker_secret_key.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Per-account strategy configuration: trigger mode plus its parameters.
///
/// Fields other than the one selected by `trigger_mode` are ignored for
/// scheduling purposes but retained verbatim, so switching modes and back
/// does not lose the account's previously configured interval/batch size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub account_id: AccountId,
    pub enabled: bool,
    pub trigger_mode: TriggerMode,
    /// Symbols this account trades. Falls back to the engine-wide default
    /// set when empty.
    pub symbols: Vec<String>,
    /// `interval` mode: minimum seconds between triggers.
    pub interval_seconds: u64,
    /// `tick_batch` mode: number of qualifying price ticks to accumulate
    /// before triggering.
    pub tick_batch_size: u32,
    /// UTC timestamp (RFC3339) of the last successful trigger, or `None` if
    /// this account has never fired. Advances monotonically; persisted so a
    /// restart does not immediately re-trigger every account.
    pub last_trigger_at: Option<String>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            account_id: AccountId(0),
            enabled: true,
            trigger_mode: TriggerMode::Interval,
            symbols: Vec::new(),
            interval_seconds: 300,
            tick_batch_size: 10,
            last_trigger_at: None,
        }
    }
}

/// A reusable prompt template. `{placeholder}` keys are substituted from the
/// closed prompt-context key set; unknown/missing keys render literally as
/// `N/A`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: i64,
    pub name: String,
    pub template_text: String,
    pub is_default: bool,
}

/// One oracle invocation and its outcome, persisted for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLog {
    pub id: i64,
    pub account_id: AccountId,
    pub decided_at: String,
    pub operation: String,
    pub symbol: String,
    pub previous_portion: Option<f64>,
    pub target_portion: Option<f64>,
    pub total_balance: f64,
    pub executed: bool,
    pub broker_order_id: Option<String>,
    pub prompt_snapshot: Option<String>,
    pub reasoning_snapshot: Option<String>,
    pub raw_snapshot: Option<String>,
    pub reason: Option<String>,
}

/// A point-in-time valuation of one account, written on every price event
/// that touches that account's holdings, plus periodically by the
/// broadcaster for accounts with live subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetSnapshot {
    pub id: i64,
    pub account_id: AccountId,
    pub taken_at: String,
    pub total_assets: f64,
    pub cash: f64,
    pub positions_value: f64,
    pub trigger_symbol: Option<String>,
}
