// =============================================================================
// alpha-engine — Main Entry Point
// =============================================================================
//
// Thin wiring layer: construct every component (C1-C8 plus persistence),
// subscribe the trigger engine and the asset snapshot service to the price
// event bus, spawn the market stream's poll loop, and block on `ctrl_c()`.
// Everything that matters lives in the library so it can be exercised by
// `#[cfg(test)]` modules without touching this file.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use alpha_engine::broadcast::SubscriptionBroadcaster;
use alpha_engine::broker::client::BinanceClient;
use alpha_engine::broker::BrokerAdapter;
use alpha_engine::config::EngineConfig;
use alpha_engine::db::Database;
use alpha_engine::decision::oracle::OracleClient;
use alpha_engine::executor::ExecutorConfig;
use alpha_engine::market::MarketStream;
use alpha_engine::price::{PriceCache, PriceEventBus};
use alpha_engine::runner::EngineDecisionRunner;
use alpha_engine::snapshot::AssetSnapshotService;
use alpha_engine::trigger::TriggerEngine;

const BINANCE_BASE_URL: &str = "https://api.binance.com";
const DEFAULT_CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("alpha-engine starting up");

    let config_path = std::env::var("ENGINE_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = EngineConfig::load(&config_path)
        .unwrap_or_else(|e| {
            warn!(path = %config_path, error = %e, "could not load engine config, falling back to defaults");
            EngineConfig::default()
        })
        .apply_env_overrides();

    if !config.oracle_verify_tls {
        warn!("oracle TLS certificate verification is disabled (ENABLE_SSL_VERIFICATION=false)");
    }

    let db = Arc::new(Database::open(&config.db_path)?);
    info!(path = %config.db_path, "database opened");

    let price_cache = Arc::new(PriceCache::new(
        Duration::from_secs(config.price_ttl_secs),
        Duration::from_secs(config.price_history_secs),
    ));
    let price_bus = Arc::new(PriceEventBus::new());

    let broker: Arc<dyn BrokerAdapter> = Arc::new(BinanceClient::new(
        BINANCE_BASE_URL,
        Duration::from_secs_f64(config.broker_rate_interval_secs),
        Duration::from_secs_f64(config.broker_cache_ttl_secs),
    ));

    let oracle = Arc::new(OracleClient::new(
        config.oracle_verify_tls,
        Duration::from_secs(config.oracle_timeout_secs),
        config.decision_max_retries,
        Duration::from_secs_f64(config.decision_backoff_base_secs),
    ));

    let snapshot_service = AssetSnapshotService::new(db.clone(), broker.clone(), price_cache.clone(), config.asset_snapshot_retention_days);

    let broadcaster = SubscriptionBroadcaster::new(
        Duration::from_secs(config.snapshot_broadcast_interval_secs),
        snapshot_service.clone(),
    );

    let executor_cfg = ExecutorConfig {
        commission_rate: config.commission_rate,
        min_commission: config.min_commission,
    };

    let decision_runner: Arc<EngineDecisionRunner> = Arc::new(EngineDecisionRunner::new(
        db.clone(),
        broker.clone(),
        oracle.clone(),
        price_cache.clone(),
        broadcaster.clone(),
        config.symbols.clone(),
        executor_cfg,
    ));

    let trigger_engine = Arc::new(TriggerEngine::new(
        db.clone(),
        Duration::from_secs(config.trigger_refresh_floor_secs),
        config.realtime_min_spacing_secs,
    ));

    let market_stream = Arc::new(MarketStream::new(
        BINANCE_BASE_URL,
        config.symbols.clone(),
        Duration::from_secs_f64(config.market_stream_interval_secs),
        chrono::Duration::seconds(config.price_history_secs as i64),
        price_cache.clone(),
        price_bus.clone(),
        db.clone(),
    ));

    // C4: every price tick re-evaluates the trigger engine's per-account state.
    {
        let trigger_engine = trigger_engine.clone();
        let decision_runner = decision_runner.clone();
        price_bus.subscribe(Arc::new(move |event: &alpha_engine::price::PriceEvent| {
            let trigger_engine = trigger_engine.clone();
            let decision_runner = decision_runner.clone();
            let event = event.clone();
            let _ = tokio::spawn(async move {
                trigger_engine.on_price_event(&event, decision_runner).await;
            });
        }));
    }

    // C7: every price tick re-values every tradeable account's holdings.
    {
        let snapshot_service = snapshot_service.clone();
        let broadcaster = broadcaster.clone();
        price_bus.subscribe(Arc::new(move |event: &alpha_engine::price::PriceEvent| {
            let snapshot_service = snapshot_service.clone();
            let broadcaster = broadcaster.clone();
            let event = event.clone();
            let _ = tokio::spawn(async move {
                snapshot_service.on_price_event(&event, &broadcaster).await;
            });
        }));
    }

    // C2: poll loop that feeds the price event bus.
    {
        let market_stream = market_stream.clone();
        tokio::spawn(async move {
            market_stream.run().await;
        });
    }

    info!(symbols = ?config.symbols, "alpha-engine is running");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, in-flight tasks are allowed to complete");

    Ok(())
}
