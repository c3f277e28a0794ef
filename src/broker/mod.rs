// =============================================================================
// Broker Adapter (C1)
// =============================================================================

pub mod client;
pub mod quantize;
pub mod rate_limit;

use async_trait::async_trait;

use crate::errors::BrokerResult;
use crate::types::{OrderType, PortfolioSnapshot};

/// An open or closed order as reported by the broker.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OrderInfo {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub quantity: f64,
    pub price: f64,
    pub status: String,
}

/// The outcome of submitting an order.
#[derive(Debug, Clone)]
pub struct OrderSubmission {
    pub order_id: String,
    pub raw: serde_json::Value,
}

/// Credentials for one account's broker connection. The adapter is
/// generalized over these rather than fixed at construction, since one
/// engine process serves many accounts.
#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub api_key: String,
    pub secret_key: String,
}

/// Dependency-inversion boundary between the engine and a concrete exchange
/// integration. A second exchange could implement this trait without
/// touching any caller.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn get_balance_and_positions(&self, creds: &BrokerCredentials) -> BrokerResult<PortfolioSnapshot>;

    async fn get_open_orders(&self, creds: &BrokerCredentials, symbol: &str) -> BrokerResult<Vec<OrderInfo>>;

    async fn get_closed_orders(&self, creds: &BrokerCredentials, symbol: &str, limit: u32) -> BrokerResult<Vec<OrderInfo>>;

    async fn execute_order(
        &self,
        creds: &BrokerCredentials,
        symbol: &str,
        side: &str,
        quantity: f64,
        price: f64,
        order_type: OrderType,
    ) -> BrokerResult<OrderSubmission>;

    async fn cancel_order(&self, creds: &BrokerCredentials, symbol: &str, order_id: &str) -> BrokerResult<()>;

    fn map_symbol_to_pair(&self, symbol: &str) -> String;

    fn broker_name(&self) -> &'static str;
}
