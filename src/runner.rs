// =============================================================================
// Decision runner wiring
// =============================================================================
//
// The concrete `DecisionRunner` the trigger engine (C4) invokes per
// triggered account: runs the decision pipeline (C5), and for an
// actionable outcome hands it to the trade executor (C6). Kept as its own
// small module rather than folded into `main.rs` so it stays testable
// without spinning up the whole process.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::broadcast::SubscriptionBroadcaster;
use crate::broker::BrokerAdapter;
use crate::db::models::Account;
use crate::db::Database;
use crate::decision::oracle::OracleClient;
use crate::decision::{run_decision_cycle, DecisionOutcome};
use crate::executor::{execute_decision, ExecutorConfig};
use crate::price::{PriceCache, PriceEvent};
use crate::trigger::DecisionRunner;

pub struct EngineDecisionRunner {
    db: Arc<Database>,
    broker: Arc<dyn BrokerAdapter>,
    oracle: Arc<OracleClient>,
    price_cache: Arc<PriceCache>,
    broadcaster: Arc<SubscriptionBroadcaster>,
    symbols: Vec<String>,
    executor_cfg: ExecutorConfig,
}

impl EngineDecisionRunner {
    pub fn new(
        db: Arc<Database>,
        broker: Arc<dyn BrokerAdapter>,
        oracle: Arc<OracleClient>,
        price_cache: Arc<PriceCache>,
        broadcaster: Arc<SubscriptionBroadcaster>,
        symbols: Vec<String>,
        executor_cfg: ExecutorConfig,
    ) -> Self {
        Self {
            db,
            broker,
            oracle,
            price_cache,
            broadcaster,
            symbols,
            executor_cfg,
        }
    }
}

#[async_trait]
impl DecisionRunner for EngineDecisionRunner {
    async fn run(&self, account: Account, event: PriceEvent) -> bool {
        let outcome = run_decision_cycle(
            &self.db,
            self.broker.as_ref(),
            &self.oracle,
            &self.price_cache,
            &account,
            &self.symbols,
            &event.symbol,
        )
        .await;

        match outcome {
            DecisionOutcome::Abandoned => {
                debug!(account_id = %account.id, "decision cycle abandoned, no reply to act on");
                false
            }
            DecisionOutcome::Invalid { log_id, operation, symbol, reason } => {
                debug!(account_id = %account.id, log_id, "decision failed validation, logged and skipped");
                self.broadcaster.broadcast_decision(
                    account.id,
                    serde_json::json!({
                        "operation": operation,
                        "symbol": symbol,
                        "executed": false,
                        "reason": reason,
                    }),
                );
                true
            }
            DecisionOutcome::Actionable {
                decision,
                portfolio: _portfolio,
                total_balance,
                prompt_snapshot,
                reasoning_snapshot,
                raw_snapshot,
            } => {
                let result = execute_decision(
                    &self.db,
                    self.broker.as_ref(),
                    &self.price_cache,
                    &account,
                    &decision,
                    total_balance,
                    prompt_snapshot,
                    reasoning_snapshot,
                    raw_snapshot,
                    &self.executor_cfg,
                )
                .await;
                self.broadcaster.broadcast_decision(
                    account.id,
                    serde_json::json!({
                        "operation": decision.operation.to_string(),
                        "symbol": decision.symbol,
                        "target_portion": decision.target_portion,
                    }),
                );
                if result.executed && result.side.is_some() {
                    self.broadcaster.broadcast_trade(
                        account.id,
                        serde_json::json!({
                            "symbol": result.symbol,
                            "side": result.side,
                            "qty": result.qty,
                            "price": result.price,
                            "broker_order_id": result.broker_order_id,
                        }),
                    );
                    if let Ok(portfolio) = self.broker.get_balance_and_positions(&crate::broker::BrokerCredentials {
                        api_key: account.broker_api_key.clone().unwrap_or_default(),
                        secret_key: account.broker_secret_key.clone().unwrap_or_default(),
                    }).await {
                        self.broadcaster.broadcast_position(
                            account.id,
                            serde_json::json!({
                                "cash": portfolio.cash,
                                "positions": portfolio.positions,
                            }),
                        );
                    }
                }
                true
            }
        }
    }
}
