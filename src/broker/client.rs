// =============================================================================
// Binance-compatible signed REST client
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::Client;
use sha2::Sha256;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::errors::{BrokerError, BrokerResult};
use crate::types::{OrderType, PortfolioSnapshot, PositionInfo};

use super::quantize::{format_decimal, is_known_symbol, quantize_order};
use super::rate_limit::RateLimiter;
use super::{BrokerAdapter, BrokerCredentials, OrderInfo, OrderSubmission};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

fn cache_key(creds: &BrokerCredentials) -> String {
    format!("{}:{}", creds.api_key, &creds.secret_key[..creds.secret_key.len().min(8)])
}

struct CachedPortfolio {
    snapshot: PortfolioSnapshot,
    cached_at: Instant,
}

/// Signed REST client for a Binance-compatible exchange. Generalized over
/// per-call credentials since one process serves many accounts; the
/// per-account balance/position cache and the process-wide rate limiter are
/// both owned here.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    rate_limiter: RateLimiter,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedPortfolio>>,
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl BinanceClient {
    pub fn new(base_url: impl Into<String>, rate_interval: Duration, cache_ttl: Duration) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            rate_limiter: RateLimiter::new(rate_interval),
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Invalidate the cached balance/positions for one set of credentials.
    /// Called on any broker error and after every successful order.
    pub fn invalidate_cache(&self, creds: &BrokerCredentials) {
        self.cache.lock().remove(&cache_key(creds));
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis() as u64
    }

    fn sign(secret: &str, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts key of any length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(creds: &BrokerCredentials, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let with_meta = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let signature = Self::sign(&creds.secret_key, &with_meta);
        format!("{with_meta}&signature={signature}")
    }

    fn classify_status(status: reqwest::StatusCode, body: &serde_json::Value) -> BrokerError {
        let msg = body
            .get("msg")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();
        match status.as_u16() {
            401 => BrokerError::Unauthorized,
            403 => BrokerError::Forbidden,
            451 => BrokerError::GeoRestricted,
            429 => BrokerError::RateLimited,
            _ => BrokerError::ExchangeRejected(msg),
        }
    }

    #[instrument(skip(self, creds), name = "broker::get_balance_and_positions")]
    async fn fetch_balance_and_positions(
        &self,
        creds: &BrokerCredentials,
    ) -> BrokerResult<PortfolioSnapshot> {
        self.rate_limiter.wait_turn().await;

        let query = Self::signed_query(creds, "");
        let url = format!("{}/api/v3/account?{}", self.base_url, query);

        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::MalformedResponse(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let balances = body
            .get("balances")
            .and_then(|v| v.as_array())
            .ok_or_else(|| BrokerError::MalformedResponse("missing balances array".to_string()))?;

        let mut cash = 0.0;
        let mut positions = Vec::new();
        for entry in balances {
            let asset = entry.get("asset").and_then(|v| v.as_str()).unwrap_or("");
            let free: f64 = entry
                .get("free")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let locked: f64 = entry
                .get("locked")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);

            if asset == "USDT" || asset == "BUSD" {
                cash += free + locked;
                continue;
            }
            let total = free + locked;
            if total <= 0.0 {
                continue;
            }
            positions.push(PositionInfo {
                symbol: asset.to_string(),
                total_qty: total,
                free_qty: free,
                avg_cost: 0.0, // filled in by caller from current price; see DESIGN.md
            });
        }

        Ok(PortfolioSnapshot { cash, positions })
    }
}

#[async_trait]
impl BrokerAdapter for BinanceClient {
    async fn get_balance_and_positions(&self, creds: &BrokerCredentials) -> BrokerResult<PortfolioSnapshot> {
        if creds.api_key.is_empty() || creds.secret_key.is_empty() {
            return Err(BrokerError::CredentialMissing);
        }

        let key = cache_key(creds);
        if let Some(cached) = self.cache.lock().get(&key) {
            if cached.cached_at.elapsed() < self.cache_ttl {
                return Ok(cached.snapshot.clone());
            }
        }

        match self.fetch_balance_and_positions(creds).await {
            Ok(snapshot) => {
                self.cache.lock().insert(
                    key,
                    CachedPortfolio {
                        snapshot: snapshot.clone(),
                        cached_at: Instant::now(),
                    },
                );
                Ok(snapshot)
            }
            Err(e) => {
                self.invalidate_cache(creds);
                Err(e)
            }
        }
    }

    #[instrument(skip(self, creds), name = "broker::get_open_orders")]
    async fn get_open_orders(&self, creds: &BrokerCredentials, symbol: &str) -> BrokerResult<Vec<OrderInfo>> {
        if creds.api_key.is_empty() || creds.secret_key.is_empty() {
            return Err(BrokerError::CredentialMissing);
        }
        self.rate_limiter.wait_turn().await;

        let pair = self.map_symbol_to_pair(symbol);
        let params = format!("symbol={pair}");
        let query = Self::signed_query(creds, &params);
        let url = format!("{}/api/v3/openOrders?{}", self.base_url, query);

        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::MalformedResponse(e.to_string()))?;
        if !status.is_success() {
            self.invalidate_cache(creds);
            return Err(Self::classify_status(status, &body));
        }
        parse_orders(&body)
    }

    #[instrument(skip(self, creds), name = "broker::get_closed_orders")]
    async fn get_closed_orders(
        &self,
        creds: &BrokerCredentials,
        symbol: &str,
        limit: u32,
    ) -> BrokerResult<Vec<OrderInfo>> {
        if creds.api_key.is_empty() || creds.secret_key.is_empty() {
            return Err(BrokerError::CredentialMissing);
        }
        self.rate_limiter.wait_turn().await;

        let pair = self.map_symbol_to_pair(symbol);
        let params = format!("symbol={pair}&limit={limit}");
        let query = Self::signed_query(creds, &params);
        let url = format!("{}/api/v3/allOrders?{}", self.base_url, query);

        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::MalformedResponse(e.to_string()))?;
        if !status.is_success() {
            self.invalidate_cache(creds);
            return Err(Self::classify_status(status, &body));
        }
        let all = parse_orders(&body)?;
        Ok(all
            .into_iter()
            .filter(|o| o.status == "FILLED" || o.status == "PARTIALLY_FILLED")
            .collect())
    }

    #[instrument(skip(self, creds), name = "broker::execute_order")]
    async fn execute_order(
        &self,
        creds: &BrokerCredentials,
        symbol: &str,
        side: &str,
        quantity: f64,
        price: f64,
        order_type: OrderType,
    ) -> BrokerResult<OrderSubmission> {
        if creds.api_key.is_empty() || creds.secret_key.is_empty() {
            return Err(BrokerError::CredentialMissing);
        }
        if !is_known_symbol(symbol) {
            return Err(BrokerError::UnknownSymbol(symbol.to_string()));
        }

        let adjusted_qty = quantize_order(symbol, quantity, price)?;

        self.rate_limiter.wait_turn().await;

        let pair = self.map_symbol_to_pair(symbol);
        let qty_str = format_decimal(adjusted_qty, 10);
        let params = match order_type {
            OrderType::Market => format!(
                "symbol={pair}&side={}&type=MARKET&quantity={qty_str}",
                side.to_uppercase()
            ),
            OrderType::Limit => format!(
                "symbol={pair}&side={}&type=LIMIT&quantity={qty_str}&price={}&timeInForce=GTC",
                side.to_uppercase(),
                format_decimal(price, 10),
            ),
        };
        let query = Self::signed_query(creds, &params);
        let url = format!("{}/api/v3/order?{}", self.base_url, query);

        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::MalformedResponse(e.to_string()))?;

        if !status.is_success() || body.get("code").is_some() {
            self.invalidate_cache(creds);
            warn!(symbol, side, "order rejected by broker");
            return Err(Self::classify_status(status, &body));
        }

        let order_id = body
            .get("orderId")
            .map(|v| v.to_string())
            .ok_or_else(|| BrokerError::MalformedResponse("missing orderId in response".to_string()))?;

        self.invalidate_cache(creds);
        info!(symbol, side, order_id, "order placed");
        Ok(OrderSubmission { order_id, raw: body })
    }

    #[instrument(skip(self, creds), name = "broker::cancel_order")]
    async fn cancel_order(&self, creds: &BrokerCredentials, symbol: &str, order_id: &str) -> BrokerResult<()> {
        if creds.api_key.is_empty() || creds.secret_key.is_empty() {
            return Err(BrokerError::CredentialMissing);
        }
        self.rate_limiter.wait_turn().await;

        let pair = self.map_symbol_to_pair(symbol);
        let params = format!("symbol={pair}&orderId={order_id}");
        let query = Self::signed_query(creds, &params);
        let url = format!("{}/api/v3/order?{}", self.base_url, query);

        let resp = self
            .http
            .delete(&url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp
                .json()
                .await
                .unwrap_or_else(|_| serde_json::json!({}));
            self.invalidate_cache(creds);
            return Err(Self::classify_status(status, &body));
        }
        self.invalidate_cache(creds);
        Ok(())
    }

    fn map_symbol_to_pair(&self, symbol: &str) -> String {
        format!("{}USDT", symbol.to_uppercase())
    }

    fn broker_name(&self) -> &'static str {
        "Binance"
    }
}

fn parse_orders(body: &serde_json::Value) -> BrokerResult<Vec<OrderInfo>> {
    let arr = body
        .as_array()
        .ok_or_else(|| BrokerError::MalformedResponse("expected order list".to_string()))?;
    Ok(arr
        .iter()
        .map(|o| OrderInfo {
            order_id: o.get("orderId").map(|v| v.to_string()).unwrap_or_default(),
            symbol: o.get("symbol").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            side: o.get("side").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            order_type: o.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            quantity: o
                .get("origQty")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            price: o
                .get("price")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            status: o.get("status").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_symbol_to_pair_appends_usdt() {
        let client = BinanceClient::new("https://api.binance.com", Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(client.map_symbol_to_pair("btc"), "BTCUSDT");
        assert_eq!(client.map_symbol_to_pair("ETH"), "ETHUSDT");
    }

    #[test]
    fn signed_query_appends_timestamp_recvwindow_and_signature() {
        let creds = BrokerCredentials {
            api_key: "k".to_string(),
            secret_key: "s".to_string(),
        };
        let q = BinanceClient::signed_query(&creds, "symbol=BTCUSDT");
        assert!(q.contains("symbol=BTCUSDT"));
        assert!(q.contains("timestamp="));
        assert!(q.contains("recvWindow=5000"));
        assert!(q.contains("signature="));
    }

    #[tokio::test]
    async fn missing_credentials_short_circuits_without_a_network_call() {
        let client = BinanceClient::new("https://api.binance.com", Duration::from_secs(10), Duration::from_secs(5));
        let creds = BrokerCredentials {
            api_key: String::new(),
            secret_key: String::new(),
        };
        let err = client.get_balance_and_positions(&creds).await.unwrap_err();
        assert!(matches!(err, BrokerError::CredentialMissing));
    }

    #[tokio::test]
    async fn execute_order_rejects_unknown_symbol_without_a_network_call() {
        let client = BinanceClient::new("https://api.binance.com", Duration::from_secs(10), Duration::from_secs(5));
        let creds = BrokerCredentials {
            api_key: "k".to_string(),
            secret_key: "s".to_string(),
        };
        let err = client
            .execute_order(&creds, "SHIB", "BUY", 1.0, 1.0, crate::types::OrderType::Market)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownSymbol(s) if s == "SHIB"));
    }
}
