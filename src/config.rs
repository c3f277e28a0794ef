// =============================================================================
// Engine Configuration — process-wide tunables with env overrides and
// atomic-save persistence
// =============================================================================
//
// Every tunable the engine needs lives here. Fields carry `#[serde(default =
// "...")]` so that adding a field never breaks loading an older config file,
// matching the project's established config idiom.
//
// Persistence uses the same atomic tmp + rename pattern used elsewhere in
// this codebase to avoid corrupting the file on crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_symbols() -> Vec<String> {
    vec![
        "BTC".to_string(),
        "ETH".to_string(),
        "SOL".to_string(),
        "BNB".to_string(),
        "XRP".to_string(),
        "DOGE".to_string(),
    ]
}

fn default_broker_rate_interval_secs() -> f64 {
    10.0
}

fn default_broker_cache_ttl_secs() -> f64 {
    5.0
}

fn default_market_stream_interval_secs() -> f64 {
    1.5
}

fn default_price_ttl_secs() -> u64 {
    30
}

fn default_price_history_secs() -> u64 {
    3600
}

fn default_decision_max_retries() -> u32 {
    3
}

fn default_decision_backoff_base_secs() -> f64 {
    1.0
}

fn default_oracle_timeout_secs() -> u64 {
    30
}

fn default_commission_rate() -> f64 {
    0.001
}

fn default_min_commission() -> f64 {
    0.1
}

fn default_snapshot_broadcast_interval_secs() -> u64 {
    30
}

fn default_asset_snapshot_retention_days() -> i64 {
    30
}

fn default_db_path() -> String {
    "engine.sqlite3".to_string()
}

fn default_false() -> bool {
    false
}

fn default_trigger_refresh_floor_secs() -> u64 {
    60
}

fn default_realtime_min_spacing_secs() -> u64 {
    1
}

/// Process-wide configuration for the engine. All fields have sensible
/// defaults so an empty/missing config file is a valid starting point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default tradeable symbol set (overridable per strategy config).
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Minimum spacing, in seconds, enforced between consecutive signed
    /// broker requests by the process-wide rate limiter.
    #[serde(default = "default_broker_rate_interval_secs")]
    pub broker_rate_interval_secs: f64,

    /// TTL, in seconds, for the per-account balance/positions cache.
    #[serde(default = "default_broker_cache_ttl_secs")]
    pub broker_cache_ttl_secs: f64,

    /// Cadence, in seconds, of the market stream's price poll loop.
    #[serde(default = "default_market_stream_interval_secs")]
    pub market_stream_interval_secs: f64,

    /// TTL, in seconds, for a cached price entry in the price cache.
    #[serde(default = "default_price_ttl_secs")]
    pub price_ttl_secs: u64,

    /// Length, in seconds, of the rolling price-history window retained per
    /// symbol/market pair.
    #[serde(default = "default_price_history_secs")]
    pub price_history_secs: u64,

    /// Maximum number of oracle call attempts per endpoint before moving to
    /// the next fallback endpoint.
    #[serde(default = "default_decision_max_retries")]
    pub decision_max_retries: u32,

    /// Base, in seconds, of the exponential backoff used between oracle
    /// retry attempts (actual wait is `base * 2^attempt + jitter`).
    #[serde(default = "default_decision_backoff_base_secs")]
    pub decision_backoff_base_secs: f64,

    /// Per-request timeout, in seconds, for oracle HTTP calls.
    #[serde(default = "default_oracle_timeout_secs")]
    pub oracle_timeout_secs: u64,

    /// Whether to verify TLS certificates on oracle HTTP calls. Defaults to
    /// `false` to match deployments that front the oracle with a
    /// self-signed proxy; disabling this is logged as a warning at startup.
    #[serde(default = "default_false")]
    pub oracle_verify_tls: bool,

    /// Commission rate applied to notional value on BUY/SELL/CLOSE.
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,

    /// Minimum commission charged regardless of notional size, in quote
    /// currency units.
    #[serde(default = "default_min_commission")]
    pub min_commission: f64,

    /// Default interval, in seconds, for an account's periodic broadcaster
    /// snapshot job while it has at least one live subscriber.
    #[serde(default = "default_snapshot_broadcast_interval_secs")]
    pub snapshot_broadcast_interval_secs: u64,

    /// Retention window, in days, for `AssetSnapshot` rows.
    #[serde(default = "default_asset_snapshot_retention_days")]
    pub asset_snapshot_retention_days: i64,

    /// Minimum spacing, in seconds, the trigger engine enforces on itself
    /// between consecutive `refresh()` sweeps.
    #[serde(default = "default_trigger_refresh_floor_secs")]
    pub trigger_refresh_floor_secs: u64,

    /// Minimum spacing, in seconds, enforced between realtime-mode triggers
    /// for a given account/symbol pair, regardless of strategy config.
    #[serde(default = "default_realtime_min_spacing_secs")]
    pub realtime_min_spacing_secs: u64,

    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            broker_rate_interval_secs: default_broker_rate_interval_secs(),
            broker_cache_ttl_secs: default_broker_cache_ttl_secs(),
            market_stream_interval_secs: default_market_stream_interval_secs(),
            price_ttl_secs: default_price_ttl_secs(),
            price_history_secs: default_price_history_secs(),
            decision_max_retries: default_decision_max_retries(),
            decision_backoff_base_secs: default_decision_backoff_base_secs(),
            oracle_timeout_secs: default_oracle_timeout_secs(),
            oracle_verify_tls: default_false(),
            commission_rate: default_commission_rate(),
            min_commission: default_min_commission(),
            snapshot_broadcast_interval_secs: default_snapshot_broadcast_interval_secs(),
            asset_snapshot_retention_days: default_asset_snapshot_retention_days(),
            trigger_refresh_floor_secs: default_trigger_refresh_floor_secs(),
            realtime_min_spacing_secs: default_realtime_min_spacing_secs(),
            db_path: default_db_path(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`. Callers should fall
    /// back to `EngineConfig::default()` with a warning if this errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;
        info!(path = %path.display(), symbols = ?config.symbols, "engine config loaded");
        Ok(config)
    }

    /// Overlay environment-variable overrides onto this config. Mirrors the
    /// env-override pattern used for startup symbol/bind-address overrides
    /// elsewhere in this codebase.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(symbols) = std::env::var("ENGINE_SYMBOLS") {
            let parsed: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                info!(symbols = ?parsed, "overriding symbol set from ENGINE_SYMBOLS");
                self.symbols = parsed;
            }
        }
        if let Ok(path) = std::env::var("ENGINE_DB_PATH") {
            self.db_path = path;
        }
        if let Ok(v) = std::env::var("ENABLE_SSL_VERIFICATION") {
            self.oracle_verify_tls = matches!(v.trim().to_lowercase().as_str(), "true" | "1");
        }
        self
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.symbols, vec!["BTC", "ETH", "SOL", "BNB", "XRP", "DOGE"]);
        assert_eq!(cfg.broker_rate_interval_secs, 10.0);
        assert_eq!(cfg.broker_cache_ttl_secs, 5.0);
        assert_eq!(cfg.price_ttl_secs, 30);
        assert_eq!(cfg.price_history_secs, 3600);
        assert_eq!(cfg.decision_max_retries, 3);
        assert_eq!(cfg.asset_snapshot_retention_days, 30);
        assert!(!cfg.oracle_verify_tls);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols.len(), 6);
        assert_eq!(cfg.commission_rate, 0.001);
        assert_eq!(cfg.min_commission, 0.1);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETH"], "broker_rate_interval_secs": 20.0 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETH"]);
        assert_eq!(cfg.broker_rate_interval_secs, 20.0);
        assert_eq!(cfg.price_ttl_secs, 30);
    }

    #[test]
    fn env_override_parses_symbol_list() {
        std::env::set_var("ENGINE_SYMBOLS", "btc, eth ,sol");
        let cfg = EngineConfig::default().apply_env_overrides();
        assert_eq!(cfg.symbols, vec!["BTC", "ETH", "SOL"]);
        std::env::remove_var("ENGINE_SYMBOLS");
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.db_path, cfg2.db_path);
    }
}
