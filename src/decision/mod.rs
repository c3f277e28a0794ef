// =============================================================================
// Decision Pipeline (C5)
// =============================================================================
//
// Ties together portfolio context assembly, prompt rendering, the oracle
// HTTP call, three-stage reply parsing, and semantic validation into one
// per-account decision cycle. Called by the trigger engine (C4) once per
// fired trigger, never concurrently for the same account (single-flight is
// the trigger engine's responsibility, not this module's).
// =============================================================================

pub mod context;
pub mod oracle;
pub mod parse;
pub mod prompt;
pub mod validate;

use chrono::Utc;
use tracing::{info, warn};

use crate::broker::{BrokerAdapter, BrokerCredentials};
use crate::db::models::{Account, NewDecisionLog};
use crate::db::Database;
use crate::price::PriceCache;

use context::{build_portfolio_context, PortfolioContext};
use oracle::OracleClient;
use parse::parse_decision_json;
use prompt::{portfolio_json, portfolio_positions_json, prices_json, render, PromptContext, NO_NEWS_AVAILABLE, OUTPUT_FORMAT};
use validate::{validate_decision, ValidatedDecision};

/// What came out of one decision cycle, and what the caller (the executor,
/// C6) should do about it.
pub enum DecisionOutcome {
    /// The oracle call or reply parsing failed outright. Nothing is
    /// persisted: "the oracle had nothing to say."
    Abandoned,
    /// The reply parsed but failed semantic validation. A `DecisionLog` row
    /// was written with `executed = false`; there is nothing to execute.
    /// Carries enough of that row back to the caller to broadcast a
    /// `DecisionUpdate` without a second database round trip.
    Invalid {
        log_id: i64,
        operation: String,
        symbol: String,
        reason: String,
    },
    /// A valid, actionable decision. The caller still owns execution and is
    /// responsible for writing the final `executed`/`broker_order_id` state
    /// via `Database::insert_decision_log` after attempting the trade — this
    /// variant's `log_id` is a placeholder pre-execution row that the
    /// executor may update in place, or supersede with its own row,
    /// depending on how it chooses to record the outcome.
    Actionable {
        decision: ValidatedDecision,
        portfolio: PortfolioContext,
        total_balance: f64,
        prompt_snapshot: String,
        reasoning_snapshot: String,
        raw_snapshot: String,
    },
}

fn reasoning_snapshot_for(decision_json: &serde_json::Value, model_reasoning: Option<&str>) -> String {
    if let Some(strategy) = decision_json.get("trading_strategy").and_then(|v| v.as_str()) {
        if !strategy.trim().is_empty() {
            return strategy.to_string();
        }
    }
    if let Some(r) = model_reasoning {
        if !r.trim().is_empty() {
            return r.to_string();
        }
    }
    String::new()
}

/// Run one full decision cycle for `account`: assemble portfolio context,
/// render the bound prompt template, call the oracle, parse its reply, and
/// validate it. Writes a `DecisionLog` row itself only for the "parsed but
/// invalid" case; actionable decisions are left for the executor to log
/// alongside the trade outcome so `broker_order_id` and the final
/// `executed` flag land in a single row.
#[allow(clippy::too_many_arguments)]
pub async fn run_decision_cycle(
    db: &Database,
    broker: &dyn BrokerAdapter,
    oracle: &OracleClient,
    price_cache: &PriceCache,
    account: &Account,
    symbols: &[String],
    trigger_symbol: &str,
) -> DecisionOutcome {
    let creds = BrokerCredentials {
        api_key: account.broker_api_key.clone().unwrap_or_default(),
        secret_key: account.broker_secret_key.clone().unwrap_or_default(),
    };

    let portfolio = match build_portfolio_context(broker, &creds, price_cache).await {
        Ok(p) => p,
        Err(e) => {
            warn!(account_id = %account.id, error = %e, "could not assemble portfolio context, abandoning cycle");
            return DecisionOutcome::Abandoned;
        }
    };

    let template = match db.get_prompt_for_account(account.id) {
        Ok(t) => t.template_text,
        Err(e) => {
            warn!(account_id = %account.id, error = %e, "could not load prompt template, abandoning cycle");
            return DecisionOutcome::Abandoned;
        }
    };

    let extra_prices: Vec<(String, f64)> = symbols
        .iter()
        .filter_map(|s| price_cache.get(s).map(|p| (s.clone(), p)))
        .collect();

    let ctx = PromptContext {
        session_context: Some(format!("triggered by {trigger_symbol}")),
        market_snapshot: Some(prices_json(&portfolio, &extra_prices)),
        account_state: Some(portfolio_json(&portfolio)),
        decision_task: Some("Decide the single best action for this account right now.".to_string()),
        output_format: Some(OUTPUT_FORMAT.to_string()),
        prices_json: Some(prices_json(&portfolio, &extra_prices)),
        portfolio_json: Some(portfolio_json(&portfolio)),
        portfolio_positions_json: Some(portfolio_positions_json(&portfolio)),
        news_section: Some(NO_NEWS_AVAILABLE.to_string()),
        account_name: Some(account.name.clone()),
        model_name: Some(account.oracle_model.clone()),
    };
    let rendered_prompt = render(&template, &ctx);

    let (assistant_text, model_reasoning) = match oracle.call(account, &rendered_prompt).await {
        Ok(t) => t,
        Err(e) => {
            warn!(account_id = %account.id, error = %e, "oracle call failed, abandoning cycle");
            return DecisionOutcome::Abandoned;
        }
    };

    let decision_json = match parse_decision_json(&assistant_text) {
        Some(v) => v,
        None => {
            warn!(account_id = %account.id, "oracle reply could not be parsed, abandoning cycle");
            return DecisionOutcome::Abandoned;
        }
    };

    let reasoning_snapshot = reasoning_snapshot_for(&decision_json, model_reasoning.as_deref());

    match validate_decision(&decision_json, symbols) {
        Ok(decision) => {
            info!(account_id = %account.id, operation = %decision.operation, symbol = ?decision.symbol, "decision validated");
            DecisionOutcome::Actionable {
                decision,
                total_balance: portfolio.total_assets,
                portfolio,
                prompt_snapshot: rendered_prompt,
                reasoning_snapshot,
                raw_snapshot: decision_json.to_string(),
            }
        }
        Err(e) => {
            warn!(account_id = %account.id, error = %e, "decision failed semantic validation");
            let operation = decision_json.get("operation").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
            let symbol = decision_json.get("symbol").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let reason = e.0;
            let entry = NewDecisionLog {
                account_id: account.id,
                decided_at: Utc::now().to_rfc3339(),
                operation: operation.clone(),
                symbol: symbol.clone(),
                previous_portion: None,
                target_portion: decision_json.get("target_portion_of_balance").and_then(|v| v.as_f64()),
                total_balance: portfolio.total_assets,
                executed: false,
                broker_order_id: None,
                prompt_snapshot: Some(rendered_prompt),
                reasoning_snapshot: Some(reasoning_snapshot),
                raw_snapshot: Some(decision_json.to_string()),
                reason: Some(reason.clone()),
            };
            match db.insert_decision_log(&entry) {
                Ok(log_id) => DecisionOutcome::Invalid { log_id, operation, symbol, reason },
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "failed to persist invalid decision log");
                    DecisionOutcome::Abandoned
                }
            }
        }
    }
}
