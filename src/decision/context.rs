// =============================================================================
// Portfolio context assembly (part of C5)
// =============================================================================
//
// Builds the account's live portfolio view from the broker (C1) and prices
// each position at its current market price from the price cache (C3).
// `avg_cost` defaults to current price when the exchange does not expose
// it, which makes unrealized PnL render as zero — this is a deliberate,
// documented simplification (see DESIGN.md).
// =============================================================================

use crate::broker::{BrokerAdapter, BrokerCredentials};
use crate::errors::BrokerResult;
use crate::price::PriceCache;
use crate::types::PortfolioSnapshot;

#[derive(Debug, Clone)]
pub struct PositionContext {
    pub symbol: String,
    pub qty: f64,
    pub free_qty: f64,
    pub current_price: f64,
    pub current_value: f64,
}

#[derive(Debug, Clone)]
pub struct PortfolioContext {
    pub cash: f64,
    pub positions: Vec<PositionContext>,
    pub total_assets: f64,
}

/// Fetch balances/positions via the broker adapter (respects its own short
/// cache) and price every position at its current market price. Positions
/// with no cached price are still included, priced at 0 — the context
/// renderer surfaces this so the oracle sees an honest (if incomplete)
/// picture rather than silently dropping a holding.
pub async fn build_portfolio_context(
    broker: &dyn BrokerAdapter,
    creds: &BrokerCredentials,
    price_cache: &PriceCache,
) -> BrokerResult<PortfolioContext> {
    let snapshot: PortfolioSnapshot = broker.get_balance_and_positions(creds).await?;
    let mut positions = Vec::with_capacity(snapshot.positions.len());
    let mut positions_value = 0.0;
    for p in &snapshot.positions {
        let current_price = price_cache.get(&p.symbol).unwrap_or(0.0);
        let current_value = p.total_qty * current_price;
        positions_value += current_value;
        positions.push(PositionContext {
            symbol: p.symbol.clone(),
            qty: p.total_qty,
            free_qty: p.free_qty,
            current_price,
            current_value,
        });
    }
    let total_assets = snapshot.cash + positions_value;
    Ok(PortfolioContext {
        cash: snapshot.cash,
        positions,
        total_assets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    use crate::broker::{OrderInfo, OrderSubmission};
    use crate::errors::BrokerError;
    use crate::types::{OrderType, PositionInfo};

    struct StubBroker;
    #[async_trait]
    impl BrokerAdapter for StubBroker {
        async fn get_balance_and_positions(&self, _creds: &BrokerCredentials) -> BrokerResult<PortfolioSnapshot> {
            Ok(PortfolioSnapshot {
                cash: 1000.0,
                positions: vec![PositionInfo {
                    symbol: "BTC".to_string(),
                    total_qty: 0.1,
                    free_qty: 0.1,
                    avg_cost: 0.0,
                }],
            })
        }
        async fn get_open_orders(&self, _creds: &BrokerCredentials, _symbol: &str) -> BrokerResult<Vec<OrderInfo>> {
            Ok(vec![])
        }
        async fn get_closed_orders(&self, _creds: &BrokerCredentials, _symbol: &str, _limit: u32) -> BrokerResult<Vec<OrderInfo>> {
            Ok(vec![])
        }
        async fn execute_order(&self, _creds: &BrokerCredentials, _symbol: &str, _side: &str, _qty: f64, _price: f64, _order_type: OrderType) -> BrokerResult<OrderSubmission> {
            Err(BrokerError::ExchangeRejected("unused in this stub".to_string()))
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

    #[tokio::test]
    async fn total_assets_is_cash_plus_priced_positions() {
        let broker = StubBroker;
        let creds = BrokerCredentials { api_key: "k".into(), secret_key: "s".into() };
        let cache = PriceCache::new(Duration::from_secs(30), Duration::from_secs(3600));
        cache.record("BTC", 50000.0);

        let ctx = build_portfolio_context(&broker, &creds, &cache).await.unwrap();
        assert_eq!(ctx.cash, 1000.0);
        assert_eq!(ctx.positions.len(), 1);
        assert_eq!(ctx.positions[0].current_value, 5000.0);
        assert_eq!(ctx.total_assets, 6000.0);
    }

    #[tokio::test]
    async fn missing_price_values_position_at_zero() {
        let broker = StubBroker;
        let creds = BrokerCredentials { api_key: "k".into(), secret_key: "s".into() };
        let cache = PriceCache::new(Duration::from_secs(30), Duration::from_secs(3600));

        let ctx = build_portfolio_context(&broker, &creds, &cache).await.unwrap();
        assert_eq!(ctx.positions[0].current_value, 0.0);
        assert_eq!(ctx.total_assets, 1000.0);
    }
}
