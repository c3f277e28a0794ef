// =============================================================================
// Market Stream (C2)
// =============================================================================
//
// Polls the exchange's public ticker endpoint for each configured symbol on
// a steady cadence and publishes a `PriceEvent` for every successful fetch.
// Public ticker calls are unsigned and bypass both the broker rate limiter
// and the per-account balance cache — those exist for signed per-account
// calls only.
//
// A fetch failure for one symbol is logged and does not block the other
// symbols in the same tick; this is one of the three outermost loops (the
// others being event-bus dispatch and trigger refresh) allowed to recover
// from an arbitrary error and continue.
//
// The symbol set is mutable at runtime via `set_symbols`; a change takes
// effect starting with the next iteration, never mid-iteration.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use reqwest::Client;
use tracing::{debug, warn};

use crate::db::Database;
use crate::price::{PriceCache, PriceEvent, PriceEventBus};

const VENUE: &str = "binance";

pub struct MarketStream {
    http: Client,
    base_url: String,
    symbols: RwLock<Vec<String>>,
    interval: Duration,
    tick_retention: chrono::Duration,
    cache: Arc<PriceCache>,
    bus: Arc<PriceEventBus>,
    db: Arc<Database>,
}

impl MarketStream {
    pub fn new(
        base_url: impl Into<String>,
        symbols: Vec<String>,
        interval: Duration,
        tick_retention: chrono::Duration,
        cache: Arc<PriceCache>,
        bus: Arc<PriceEventBus>,
        db: Arc<Database>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            symbols: RwLock::new(symbols),
            interval,
            tick_retention,
            cache,
            bus,
            db,
        }
    }

    /// Replace the tradeable symbol set. Takes effect on the next iteration
    /// of `run`; never observed mid-iteration.
    pub fn set_symbols(&self, symbols: Vec<String>) {
        *self.symbols.write() = symbols;
    }

    pub fn symbols(&self) -> Vec<String> {
        self.symbols.read().clone()
    }

    /// Run the poll loop forever. Intended to be spawned as a background
    /// task; never returns under normal operation.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            let symbols = self.symbols();
            for symbol in &symbols {
                match self.fetch_price(symbol).await {
                    Ok(price) => {
                        let event_time = Utc::now();
                        self.cache.record(symbol, price);
                        if let Err(e) =
                            self.db.insert_price_tick(symbol, VENUE, price, event_time, self.tick_retention)
                        {
                            warn!(symbol, error = %e, "failed to persist price tick, continuing");
                        }
                        self.bus.publish(PriceEvent {
                            symbol: symbol.clone(),
                            venue: VENUE.to_string(),
                            price,
                            event_time,
                        });
                        debug!(symbol, price, "price tick");
                    }
                    Err(e) => {
                        warn!(symbol, error = %e, "market stream fetch failed, continuing");
                    }
                }
            }
            self.cache.clear_expired();
        }
    }

    async fn fetch_price(&self, symbol: &str) -> anyhow::Result<f64> {
        let pair = format!("{}USDT", symbol.to_uppercase());
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, pair);
        let resp = self.http.get(&url).send().await?;
        let body: serde_json::Value = resp.json().await?;
        let price: f64 = body
            .get("price")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing price field"))?
            .parse()?;
        Ok(price)
    }
}
