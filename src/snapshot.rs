// =============================================================================
// Asset Snapshot Service (C7)
// =============================================================================
//
// Subscribes to the price event bus (C3) and, on every tick, values every
// tradeable account's holdings at the current market price, persisting one
// `AssetSnapshot` row per account and immediately pushing it to that
// account's C8 subscribers (if any). Also implements `SnapshotProvider` so
// C8's periodic per-account job can ask for a fresh snapshot on its own
// cadence, independent of price events — those rows carry `trigger_symbol
// = None`.
//
// A missing cached price for a held symbol means that position is skipped
// from the valuation rather than priced at a guess; the account's other
// positions and cash still go through.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::broadcast::{SnapshotProvider, SubscriptionBroadcaster};
use crate::broker::{BrokerAdapter, BrokerCredentials};
use crate::db::Database;
use crate::price::{PriceCache, PriceEvent};
use crate::types::AccountId;

pub struct AssetSnapshotService {
    db: Arc<Database>,
    broker: Arc<dyn BrokerAdapter>,
    price_cache: Arc<PriceCache>,
    retention_days: i64,
}

impl AssetSnapshotService {
    pub fn new(db: Arc<Database>, broker: Arc<dyn BrokerAdapter>, price_cache: Arc<PriceCache>, retention_days: i64) -> Arc<Self> {
        Arc::new(Self {
            db,
            broker,
            price_cache,
            retention_days,
        })
    }

    /// Value and persist a snapshot for one account, optionally tagged with
    /// the symbol that triggered the write. Returns the JSON payload pushed
    /// to subscribers, or `None` if the broker call itself failed.
    async fn snapshot_account(&self, account_id: AccountId, trigger_symbol: Option<&str>) -> Option<Value> {
        let account = match self.db.get_account(account_id) {
            Ok(a) => a,
            Err(e) => {
                warn!(%account_id, error = %e, "could not load account for asset snapshot");
                return None;
            }
        };
        if !account.has_broker_credentials() {
            return None;
        }
        let creds = BrokerCredentials {
            api_key: account.broker_api_key.clone().unwrap_or_default(),
            secret_key: account.broker_secret_key.clone().unwrap_or_default(),
        };
        let portfolio = match self.broker.get_balance_and_positions(&creds).await {
            Ok(p) => p,
            Err(e) => {
                warn!(%account_id, error = %e, "broker call failed while taking asset snapshot");
                return None;
            }
        };

        let mut positions_value = 0.0;
        for p in &portfolio.positions {
            match self.price_cache.get(&p.symbol) {
                Some(price) => positions_value += p.total_qty * price,
                None => debug!(%account_id, symbol = %p.symbol, "skipping position with no cached price"),
            }
        }
        let total_assets = portfolio.cash + positions_value;

        if let Err(e) = self.db.insert_asset_snapshot(account_id, total_assets, portfolio.cash, positions_value, trigger_symbol) {
            warn!(%account_id, error = %e, "failed to persist asset snapshot");
        }
        if let Err(e) = self.db.purge_asset_snapshots_older_than(self.retention_days) {
            warn!(error = %e, "failed to purge expired asset snapshots");
        }

        Some(json!({
            "account_id": account_id.0,
            "total_assets": total_assets,
            "cash": portfolio.cash,
            "positions_value": positions_value,
            "trigger_symbol": trigger_symbol,
        }))
    }

    /// Handle one price event: snapshot every tradeable account and, if any
    /// of them have live C8 subscribers, push the fresh snapshot through
    /// immediately rather than waiting for the periodic job.
    pub async fn on_price_event(&self, event: &PriceEvent, broadcaster: &SubscriptionBroadcaster) {
        let accounts = match self.db.list_tradeable_accounts() {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "could not list tradeable accounts for asset snapshot");
                return;
            }
        };

        let mut aggregate_symbol_total = 0.0;
        for account in &accounts {
            if let Some(payload) = self.snapshot_account(account.id, Some(&event.symbol)).await {
                if let Some(total) = payload.get("total_assets").and_then(|v| v.as_f64()) {
                    aggregate_symbol_total += total;
                }
                broadcaster.broadcast_position(account.id, payload);
            }
        }
        debug!(symbol = %event.symbol, accounts = accounts.len(), aggregate_symbol_total, "asset snapshot sweep complete for price event");
    }
}

#[async_trait]
impl SnapshotProvider for AssetSnapshotService {
    async fn snapshot_for(&self, account_id: AccountId) -> Option<Value> {
        self.snapshot_account(account_id, None).await
    }
}
