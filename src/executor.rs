// =============================================================================
// Trade Executor (C6)
// =============================================================================
//
// Turns a validated decision into a broker order (or a no-op for `hold`)
// and writes the final `DecisionLog` row — the single row per cycle that
// carries both the decision and its execution outcome, so `executed` and
// `broker_order_id` are never split across two writes.
//
// BUY and SELL/CLOSE each refetch balances/positions immediately before
// sizing the order: the portfolio context built earlier (for the prompt)
// may be several seconds stale by the time the oracle replies.
// =============================================================================

use chrono::Utc;
use tracing::{info, warn};

use crate::broker::quantize::quantize_order;
use crate::broker::{BrokerAdapter, BrokerCredentials};
use crate::db::models::{Account, NewDecisionLog};
use crate::db::Database;
use crate::decision::context::build_portfolio_context;
use crate::decision::validate::ValidatedDecision;
use crate::errors::BrokerError;
use crate::price::PriceCache;
use crate::types::{Operation, OrderType};

const MIN_QTY_EPSILON: f64 = 1e-6;

pub struct ExecutorConfig {
    pub commission_rate: f64,
    pub min_commission: f64,
}

fn commission_for(notional: f64, cfg: &ExecutorConfig) -> f64 {
    (notional * cfg.commission_rate).max(cfg.min_commission)
}

/// Outcome of one execution cycle, handed back to the caller so it can
/// push C8 trade/position updates without this module needing to know
/// anything about the broadcaster.
pub struct ExecutionResult {
    pub executed: bool,
    pub operation: Operation,
    pub symbol: Option<String>,
    pub side: Option<&'static str>,
    pub qty: Option<f64>,
    pub price: Option<f64>,
    pub broker_order_id: Option<String>,
    pub reason: Option<String>,
}

/// Execute `decision` for `account` and persist the outcome as a single
/// `DecisionLog` row. Never panics or propagates: every failure mode short
/// of a storage write failure ends in a logged, `executed = false` row.
pub async fn execute_decision(
    db: &Database,
    broker: &dyn BrokerAdapter,
    price_cache: &PriceCache,
    account: &Account,
    decision: &ValidatedDecision,
    total_balance: f64,
    prompt_snapshot: String,
    reasoning_snapshot: String,
    raw_snapshot: String,
    cfg: &ExecutorConfig,
) -> ExecutionResult {
    let creds = BrokerCredentials {
        api_key: account.broker_api_key.clone().unwrap_or_default(),
        secret_key: account.broker_secret_key.clone().unwrap_or_default(),
    };

    let (executed, broker_order_id, reason, side, qty, price) = match decision.operation {
        Operation::Hold => (true, None, None, None, None, None),
        Operation::Buy => execute_buy(broker, &creds, price_cache, decision, cfg).await,
        Operation::Sell | Operation::Close => execute_sell_or_close(broker, &creds, price_cache, decision, cfg).await,
    };

    if let Some(r) = &reason {
        warn!(account_id = %account.id, operation = %decision.operation, error = %r, "trade execution did not complete");
    } else {
        info!(account_id = %account.id, operation = %decision.operation, executed, "trade execution cycle complete");
    }

    let entry = NewDecisionLog {
        account_id: account.id,
        decided_at: Utc::now().to_rfc3339(),
        operation: decision.operation.to_string(),
        symbol: decision.symbol.clone().unwrap_or_default(),
        previous_portion: None,
        target_portion: Some(decision.target_portion),
        total_balance,
        executed,
        broker_order_id: broker_order_id.clone(),
        prompt_snapshot: Some(prompt_snapshot),
        reasoning_snapshot: Some(reasoning_snapshot),
        raw_snapshot: Some(raw_snapshot),
        reason: reason.clone().or_else(|| Some(decision.reason.clone())),
    };
    if let Err(e) = db.insert_decision_log(&entry) {
        warn!(account_id = %account.id, error = %e, "failed to persist decision log after execution");
    }

    ExecutionResult {
        executed,
        operation: decision.operation,
        symbol: decision.symbol.clone(),
        side,
        qty,
        price,
        broker_order_id,
        reason,
    }
}

type ExecOutcome = (bool, Option<String>, Option<String>, Option<&'static str>, Option<f64>, Option<f64>);

async fn execute_buy(
    broker: &dyn BrokerAdapter,
    creds: &BrokerCredentials,
    price_cache: &PriceCache,
    decision: &ValidatedDecision,
    cfg: &ExecutorConfig,
) -> ExecOutcome {
    let symbol = decision.symbol.as_deref().unwrap_or_default();
    let Some(price) = price_cache.get(symbol) else {
        return (false, None, Some(format!("no cached price for {symbol}")), None, None, None);
    };

    let portfolio = match build_portfolio_context(broker, creds, price_cache).await {
        Ok(p) => p,
        Err(e) => return (false, None, Some(format!("could not refresh portfolio before buy: {e}")), None, None, None),
    };

    let order_value = portfolio.cash * decision.target_portion;
    let commission = commission_for(order_value, cfg);
    let cash_needed = order_value + commission;
    if cash_needed > portfolio.cash {
        return (
            false,
            None,
            Some(format!("insufficient cash: need {cash_needed:.2}, have {:.2}", portfolio.cash)),
            None,
            None,
            None,
        );
    }

    let raw_qty = order_value / price;
    let rounded_qty = if raw_qty > 0.0 {
        ((raw_qty * 1e6).round() / 1e6).max(MIN_QTY_EPSILON)
    } else {
        raw_qty
    };
    let adjusted_qty = match quantize_order(symbol, rounded_qty, price) {
        Ok(q) => q,
        Err(e) => return (false, None, Some(e.to_string()), None, None, None),
    };

    let (ok, order_id, reason) = submit(broker, creds, symbol, "BUY", adjusted_qty, price).await;
    if ok {
        verify_buy_filled(broker, creds, symbol, adjusted_qty, order_id.as_deref()).await;
    }
    (ok, order_id, reason, Some("BUY"), Some(adjusted_qty), Some(price))
}

async fn execute_sell_or_close(
    broker: &dyn BrokerAdapter,
    creds: &BrokerCredentials,
    price_cache: &PriceCache,
    decision: &ValidatedDecision,
    cfg: &ExecutorConfig,
) -> ExecOutcome {
    let symbol = decision.symbol.as_deref().unwrap_or_default();
    let Some(price) = price_cache.get(symbol) else {
        return (false, None, Some(format!("no cached price for {symbol}")), None, None, None);
    };

    let portfolio = match build_portfolio_context(broker, creds, price_cache).await {
        Ok(p) => p,
        Err(e) => return (false, None, Some(format!("could not refresh portfolio before sell: {e}")), None, None, None),
    };

    let Some(position) = portfolio.positions.iter().find(|p| p.symbol.eq_ignore_ascii_case(symbol)) else {
        return (false, None, Some(format!("no open position in {symbol}")), None, None, None);
    };
    let prior_free_qty = position.free_qty;

    let raw_qty = (position.free_qty * decision.target_portion)
        .max(MIN_QTY_EPSILON)
        .min(position.free_qty);

    let adjusted_qty = match quantize_order(symbol, raw_qty, price) {
        Ok(q) => q,
        Err(e) => return (false, None, Some(e.to_string()), None, None, None),
    };

    let notional = adjusted_qty * price;
    let _commission = commission_for(notional, cfg); // deducted from proceeds by the exchange itself; recorded for audit via logs only

    let (ok, order_id, reason) = submit(broker, creds, symbol, "SELL", adjusted_qty, price).await;
    if ok {
        verify_sell_filled(broker, creds, symbol, adjusted_qty, prior_free_qty, order_id.as_deref()).await;
    }
    (ok, order_id, reason, Some("SELL"), Some(adjusted_qty), Some(price))
}

async fn submit(
    broker: &dyn BrokerAdapter,
    creds: &BrokerCredentials,
    symbol: &str,
    side: &str,
    qty: f64,
    price: f64,
) -> (bool, Option<String>, Option<String>) {
    match broker.execute_order(creds, symbol, side, qty, price, OrderType::Market).await {
        Ok(submission) => (true, Some(submission.order_id), None),
        Err(BrokerError::NotionalBelowMin { symbol, notional, min_notional }) => (
            false,
            None,
            Some(format!("order notional {notional:.2} below minimum {min_notional:.2} for {symbol}")),
        ),
        Err(e) => (false, None, Some(e.to_string())),
    }
}

/// Best-effort post-trade check for a fill that was just submitted.
/// Never fails the execution that already went through — a mismatch is
/// only ever logged as a warning, since the exchange's own order
/// acknowledgement is the authoritative outcome.
async fn verify_buy_filled(broker: &dyn BrokerAdapter, creds: &BrokerCredentials, symbol: &str, qty: f64, order_id: Option<&str>) {
    let portfolio = match broker.get_balance_and_positions(creds).await {
        Ok(p) => p,
        Err(e) => {
            warn!(symbol, order_id = order_id.unwrap_or("unknown"), error = %e, "post-trade verification could not refetch positions after buy");
            return;
        }
    };
    let new_qty = portfolio
        .positions
        .iter()
        .find(|p| p.symbol.eq_ignore_ascii_case(symbol))
        .map(|p| p.total_qty)
        .unwrap_or(0.0);
    if new_qty < qty * 0.95 {
        warn!(symbol, order_id = order_id.unwrap_or("unknown"), expected_qty = qty, observed_qty = new_qty, "post-trade verification: buy fill looks short of the requested quantity");
    }
}

async fn verify_sell_filled(broker: &dyn BrokerAdapter, creds: &BrokerCredentials, symbol: &str, qty: f64, prior_free_qty: f64, order_id: Option<&str>) {
    let portfolio = match broker.get_balance_and_positions(creds).await {
        Ok(p) => p,
        Err(e) => {
            warn!(symbol, order_id = order_id.unwrap_or("unknown"), error = %e, "post-trade verification could not refetch positions after sell");
            return;
        }
    };
    let remaining_qty = portfolio
        .positions
        .iter()
        .find(|p| p.symbol.eq_ignore_ascii_case(symbol))
        .map(|p| p.total_qty)
        .unwrap_or(0.0);
    let expected_ceiling = prior_free_qty - qty + qty * 0.05;
    if remaining_qty > expected_ceiling {
        warn!(
            symbol,
            order_id = order_id.unwrap_or("unknown"),
            sold_qty = qty,
            prior_free_qty,
            observed_remaining_qty = remaining_qty,
            "post-trade verification: sell fill leaves more of the position open than expected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use crate::broker::{OrderInfo, OrderSubmission};
    use crate::errors::BrokerResult;
    use crate::types::{AccountId, OrderType, PortfolioSnapshot, PositionInfo};

    struct StubBroker {
        cash: f64,
        positions: Vec<PositionInfo>,
        order_submitted: AtomicBool,
    }

    #[async_trait]
    impl BrokerAdapter for StubBroker {
        async fn get_balance_and_positions(&self, _creds: &BrokerCredentials) -> BrokerResult<PortfolioSnapshot> {
            Ok(PortfolioSnapshot {
                cash: self.cash,
                positions: self.positions.clone(),
            })
        }
        async fn get_open_orders(&self, _creds: &BrokerCredentials, _symbol: &str) -> BrokerResult<Vec<OrderInfo>> {
            Ok(vec![])
        }
        async fn get_closed_orders(&self, _creds: &BrokerCredentials, _symbol: &str, _limit: u32) -> BrokerResult<Vec<OrderInfo>> {
            Ok(vec![])
        }
        async fn execute_order(&self, _creds: &BrokerCredentials, symbol: &str, side: &str, quantity: f64, _price: f64, _order_type: OrderType) -> BrokerResult<OrderSubmission> {
            self.order_submitted.store(true, Ordering::SeqCst);
            Ok(OrderSubmission {
                order_id: format!("{side}-{symbol}-{quantity}"),
                raw: serde_json::json!({}),
            })
        }
        async fn cancel_order(&self, _creds: &BrokerCredentials, _symbol: &str, _order_id: &str) -> BrokerResult<()> {
            Ok(())
        }
        fn map_symbol_to_pair(&self, symbol: &str) -> String {
            format!("{symbol}USDT")
        }
        fn broker_name(&self) -> &'static str {
            "stub"
        }
    }

    fn sample_account() -> Account {
        Account {
            id: AccountId(1),
            name: "a".into(),
            active: true,
            auto_trading: true,
            broker_api_key: Some("k".into()),
            broker_secret_key: Some("s".into()),
            oracle_base_url: "https://x".into(),
            oracle_api_key: "k".into(),
            oracle_model: "gpt-4o".into(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    fn cfg() -> ExecutorConfig {
        ExecutorConfig {
            commission_rate: 0.001,
            min_commission: 0.1,
        }
    }

    #[tokio::test]
    async fn buy_with_sufficient_cash_submits_an_order_and_logs_it() {
        let db = Database::open_in_memory().unwrap();
        let account = sample_account();
        db.insert_account(&account).unwrap();
        let broker = StubBroker {
            cash: 10_000.0,
            positions: vec![],
            order_submitted: AtomicBool::new(false),
        };
        let cache = PriceCache::new(Duration::from_secs(30), Duration::from_secs(3600));
        cache.record("BTC", 50_000.0);

        let decision = ValidatedDecision {
            operation: Operation::Buy,
            symbol: Some("BTC".to_string()),
            target_portion: 0.5,
            reason: "momentum".to_string(),
            trading_strategy: String::new(),
        };

        execute_decision(&db, &broker, &cache, &account, &decision, 10_000.0, "prompt".into(), "reasoning".into(), "{}".into(), &cfg()).await;

        assert!(broker.order_submitted.load(Ordering::SeqCst));
        let logs = db.recent_decisions(account.id, 1).unwrap();
        assert!(logs[0].executed);
        assert!(logs[0].broker_order_id.is_some());
    }

    #[tokio::test]
    async fn buy_beyond_available_cash_is_not_executed() {
        let db = Database::open_in_memory().unwrap();
        let account = sample_account();
        db.insert_account(&account).unwrap();
        let broker = StubBroker {
            cash: 5.0,
            positions: vec![],
            order_submitted: AtomicBool::new(false),
        };
        let cache = PriceCache::new(Duration::from_secs(30), Duration::from_secs(3600));
        cache.record("BTC", 50_000.0);

        let decision = ValidatedDecision {
            operation: Operation::Buy,
            symbol: Some("BTC".to_string()),
            target_portion: 1.0,
            reason: "r".to_string(),
            trading_strategy: String::new(),
        };

        execute_decision(&db, &broker, &cache, &account, &decision, 5.0, "p".into(), "r".into(), "{}".into(), &cfg()).await;

        assert!(!broker.order_submitted.load(Ordering::SeqCst));
        let logs = db.recent_decisions(account.id, 1).unwrap();
        assert!(!logs[0].executed);
    }

    #[tokio::test]
    async fn close_with_no_position_is_not_executed() {
        let db = Database::open_in_memory().unwrap();
        let account = sample_account();
        db.insert_account(&account).unwrap();
        let broker = StubBroker {
            cash: 1000.0,
            positions: vec![],
            order_submitted: AtomicBool::new(false),
        };
        let cache = PriceCache::new(Duration::from_secs(30), Duration::from_secs(3600));
        cache.record("ETH", 3000.0);

        let decision = ValidatedDecision {
            operation: Operation::Close,
            symbol: Some("ETH".to_string()),
            target_portion: 1.0,
            reason: "r".to_string(),
            trading_strategy: String::new(),
        };

        execute_decision(&db, &broker, &cache, &account, &decision, 1000.0, "p".into(), "r".into(), "{}".into(), &cfg()).await;

        assert!(!broker.order_submitted.load(Ordering::SeqCst));
        let logs = db.recent_decisions(account.id, 1).unwrap();
        assert!(!logs[0].executed);
        assert!(logs[0].reason.as_deref().unwrap_or_default().contains("no open position"));
    }

    #[tokio::test]
    async fn sell_clamps_requested_quantity_to_free_balance() {
        let db = Database::open_in_memory().unwrap();
        let account = sample_account();
        db.insert_account(&account).unwrap();
        let broker = StubBroker {
            cash: 0.0,
            positions: vec![PositionInfo {
                symbol: "SOL".to_string(),
                total_qty: 10.0,
                free_qty: 10.0,
                avg_cost: 0.0,
            }],
            order_submitted: AtomicBool::new(false),
        };
        let cache = PriceCache::new(Duration::from_secs(30), Duration::from_secs(3600));
        cache.record("SOL", 100.0);

        let decision = ValidatedDecision {
            operation: Operation::Sell,
            symbol: Some("SOL".to_string()),
            target_portion: 2.0, // clamped to free_qty below, validation normally prevents >1 but executor defends anyway
            reason: "r".to_string(),
            trading_strategy: String::new(),
        };

        execute_decision(&db, &broker, &cache, &account, &decision, 1000.0, "p".into(), "r".into(), "{}".into(), &cfg()).await;
        assert!(broker.order_submitted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn hold_is_always_executed_with_no_order() {
        let db = Database::open_in_memory().unwrap();
        let account = sample_account();
        db.insert_account(&account).unwrap();
        let broker = StubBroker {
            cash: 100.0,
            positions: vec![],
            order_submitted: AtomicBool::new(false),
        };
        let cache = PriceCache::new(Duration::from_secs(30), Duration::from_secs(3600));

        let decision = ValidatedDecision {
            operation: Operation::Hold,
            symbol: None,
            target_portion: 0.0,
            reason: "wait".to_string(),
            trading_strategy: String::new(),
        };

        execute_decision(&db, &broker, &cache, &account, &decision, 100.0, "p".into(), "r".into(), "{}".into(), &cfg()).await;

        assert!(!broker.order_submitted.load(Ordering::SeqCst));
        let logs = db.recent_decisions(account.id, 1).unwrap();
        assert!(logs[0].executed);
        assert!(logs[0].broker_order_id.is_none());
    }
}
