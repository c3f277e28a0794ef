// =============================================================================
// Strategy Trigger Engine (C4)
// =============================================================================
//
// Maintains account_id -> StrategyState and decides, on every `PriceEvent`,
// whether each account's configured trigger policy fires a decision task.
//
// Refresh loads active/tradeable accounts and mutates existing states IN
// PLACE rather than replacing the struct: a replace-then-swap would race
// with an in-flight task holding a reference to the old state. In-place
// mutation under the map-wide lock lets a running task finish on its own
// state without ever observing a mid-swap phantom.
//
// Single-flight is enforced per account via a mutex on that account's
// state: `tryTrigger` sets `running = true` and releases the lock before
// spawning, so the bus is never blocked waiting on a decision task.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::db::models::{Account, StrategyConfig};
use crate::price::PriceEvent;
use crate::types::{AccountId, TriggerMode};

/// Invoked once per triggered account. Implemented by the wiring that owns
/// the decision pipeline (C5) and trade executor (C6); kept as a trait here
/// so the trigger engine never imports C5/C6 concretely.
#[async_trait]
pub trait DecisionRunner: Send + Sync {
    /// Run the full decision -> execution flow for `account` in reaction to
    /// `event`. Returns `true` iff the oracle produced a parseable reply
    /// (even if that reply was semantically invalid or resulted in a HOLD) —
    /// this is what advances `last_trigger_at`. Any internal failure must be
    /// caught and logged by the implementation; this method must not panic
    /// or return an `Err` that propagates into the trigger engine.
    async fn run(&self, account: Account, event: PriceEvent) -> bool;
}

struct StateInner {
    config: StrategyConfig,
    account: Account,
    tick_counter: u32,
    running: bool,
}

/// Per-account trigger state. The struct itself is never replaced after
/// first insertion — `refresh` mutates its fields under the owning mutex.
struct StrategyState {
    inner: Mutex<StateInner>,
}

pub struct TriggerEngine {
    db: Arc<Database>,
    states: RwLock<HashMap<AccountId, Arc<StrategyState>>>,
    last_refresh_at: Mutex<Option<Instant>>,
    refresh_floor: StdDuration,
    realtime_min_spacing: chrono::Duration,
}

impl TriggerEngine {
    pub fn new(db: Arc<Database>, refresh_floor: StdDuration, realtime_min_spacing_secs: u64) -> Self {
        Self {
            db,
            states: RwLock::new(HashMap::new()),
            last_refresh_at: Mutex::new(None),
            refresh_floor,
            realtime_min_spacing: chrono::Duration::seconds(realtime_min_spacing_secs as i64),
        }
    }

    /// Load tradeable accounts and their strategy configs, updating
    /// existing `StrategyState`s in place and inserting new ones. Internally
    /// rate-limited to at most once per `refresh_floor`; callers may call
    /// this as often as they like (e.g. on every price event).
    pub fn refresh(&self) {
        {
            let mut last = self.last_refresh_at.lock();
            if let Some(t) = *last {
                if t.elapsed() < self.refresh_floor {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let accounts = match self.db.list_tradeable_accounts() {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "trigger refresh: failed to list tradeable accounts, keeping prior state");
                return;
            }
        };

        let mut states = self.states.write();
        let mut seen = std::collections::HashSet::new();
        for account in accounts {
            seen.insert(account.id);
            let config = match self.db.get_strategy_config(account.id) {
                Ok(c) => c,
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "trigger refresh: missing strategy config, skipping");
                    continue;
                }
            };
            match states.get(&account.id) {
                Some(existing) => {
                    let mut inner = existing.inner.lock();
                    let mode_changed = inner.config.trigger_mode != config.trigger_mode;
                    inner.config = config;
                    inner.account = account;
                    if mode_changed && inner.config.trigger_mode != TriggerMode::TickBatch {
                        inner.tick_counter = 0;
                    }
                }
                None => {
                    states.insert(
                        account.id,
                        Arc::new(StrategyState {
                            inner: Mutex::new(StateInner {
                                config,
                                account,
                                tick_counter: 0,
                                running: false,
                            }),
                        }),
                    );
                }
            }
        }
        states.retain(|id, _| seen.contains(id));
        debug!(accounts = states.len(), "trigger engine refreshed");
    }

    /// React to a published price event: refresh (rate-limited), snapshot
    /// the state map, and evaluate each account without holding the map
    /// lock during dispatch.
    pub async fn on_price_event(&self, event: &PriceEvent, runner: Arc<dyn DecisionRunner>) {
        self.refresh();

        let snapshot: Vec<(AccountId, Arc<StrategyState>)> = {
            let states = self.states.read();
            states.iter().map(|(id, s)| (*id, s.clone())).collect()
        };

        for (account_id, state) in snapshot {
            let (should, account) = {
                let mut inner = state.inner.lock();
                if inner.config.trigger_mode == TriggerMode::TickBatch {
                    inner.tick_counter += 1;
                } else {
                    inner.tick_counter = 0;
                }
                let should = should_trigger(&inner, event.event_time, self.realtime_min_spacing);
                (should, inner.account.clone())
            };

            if !should {
                continue;
            }
            if !account.is_oracle_configured() {
                continue;
            }

            self.try_trigger(account_id, state, event.clone(), runner.clone());
        }
    }

    fn try_trigger(
        &self,
        account_id: AccountId,
        state: Arc<StrategyState>,
        event: PriceEvent,
        runner: Arc<dyn DecisionRunner>,
    ) {
        let account = {
            let mut inner = state.inner.lock();
            if inner.running {
                debug!(%account_id, "skip: decision task already running (single-flight)");
                return;
            }
            inner.running = true;
            inner.account.clone()
        };

        let db = self.db.clone();
        tokio::spawn(async move {
            let success = runner.run(account, event.clone()).await;
            if success {
                let at = event.event_time.to_rfc3339();
                {
                    let mut inner = state.inner.lock();
                    inner.config.last_trigger_at = Some(at.clone());
                }
                if let Err(e) = db.touch_last_trigger_at(account_id, &at) {
                    warn!(%account_id, error = %e, "failed to persist last_trigger_at");
                }
                info!(%account_id, "decision task completed, last_trigger_at advanced");
            }
            let mut inner = state.inner.lock();
            inner.running = false;
            inner.tick_counter = 0;
        });
    }
}

fn should_trigger(
    inner: &StateInner,
    event_time: DateTime<Utc>,
    realtime_min_spacing: chrono::Duration,
) -> bool {
    if !inner.config.enabled || !inner.account.active || !inner.account.auto_trading {
        return false;
    }
    let last_trigger_at = inner
        .config
        .last_trigger_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    match inner.config.trigger_mode {
        TriggerMode::Realtime => match last_trigger_at {
            None => true,
            Some(last) => event_time - last >= realtime_min_spacing,
        },
        TriggerMode::Interval => match last_trigger_at {
            None => true,
            Some(last) => event_time - last >= chrono::Duration::seconds(inner.config.interval_seconds as i64),
        },
        TriggerMode::TickBatch => inner.tick_counter >= inner.config.tick_batch_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Account;

    fn sample_account(id: i64) -> Account {
        Account {
            id: AccountId(id),
            name: "a".to_string(),
            active: true,
            auto_trading: true,
            broker_api_key: Some("k".to_string()),
            broker_secret_key: Some("s".to_string()),
            oracle_base_url: "https://api.openai.com/v1".to_string(),
            oracle_api_key: "sk-real".to_string(),
            oracle_model: "gpt-4o".to_string(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    fn sample_event(t: DateTime<Utc>) -> PriceEvent {
        PriceEvent {
            symbol: "BTC".to_string(),
            venue: "binance".to_string(),
            price: 65000.0,
            event_time: t,
        }
    }

    struct HoldRunner;
    #[async_trait]
    impl DecisionRunner for HoldRunner {
        async fn run(&self, _account: Account, _event: PriceEvent) -> bool {
            true
        }
    }

    fn setup(mode: TriggerMode) -> (Arc<Database>, TriggerEngine, AccountId) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let account = sample_account(0);
        let id = db.insert_account(&account).unwrap();
        let cfg = StrategyConfig {
            account_id: id,
            trigger_mode: mode,
            tick_batch_size: 5,
            interval_seconds: 300,
            ..StrategyConfig::default()
        };
        db.upsert_strategy_config(&cfg).unwrap();
        let engine = TriggerEngine::new(db.clone(), StdDuration::from_secs(60), 1);
        (db, engine, id)
    }

    #[tokio::test]
    async fn realtime_triggers_on_first_event() {
        let (_db, engine, _id) = setup(TriggerMode::Realtime);
        let runner = Arc::new(HoldRunner);
        engine.on_price_event(&sample_event(Utc::now()), runner).await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let states = engine.states.read();
        let state = states.values().next().unwrap();
        let inner = state.inner.lock();
        assert!(inner.config.last_trigger_at.is_some());
    }

    #[tokio::test]
    async fn single_flight_skips_while_running() {
        let (_db, engine, id) = setup(TriggerMode::Realtime);

        struct SlowRunner;
        #[async_trait]
        impl DecisionRunner for SlowRunner {
            async fn run(&self, _account: Account, _event: PriceEvent) -> bool {
                tokio::time::sleep(StdDuration::from_millis(200)).await;
                true
            }
        }
        let runner = Arc::new(SlowRunner);

        engine.refresh();
        let state = engine.states.read().get(&id).unwrap().clone();
        engine.try_trigger(id, state.clone(), sample_event(Utc::now()), runner.clone());
        // A second attempt immediately after should be skipped: running=true.
        {
            let inner = state.inner.lock();
            assert!(inner.running);
        }
        engine.try_trigger(id, state.clone(), sample_event(Utc::now()), runner);
        tokio::time::sleep(StdDuration::from_millis(250)).await;
        let inner = state.inner.lock();
        assert!(!inner.running);
    }

    #[tokio::test]
    async fn tick_batch_fires_on_nth_event_and_resets() {
        let (_db, engine, id) = setup(TriggerMode::TickBatch);
        let runner = Arc::new(HoldRunner);
        for _ in 0..4 {
            engine.on_price_event(&sample_event(Utc::now()), runner.clone()).await;
        }
        {
            let states = engine.states.read();
            let inner = states.get(&id).unwrap().inner.lock();
            assert_eq!(inner.tick_counter, 4);
            assert!(inner.config.last_trigger_at.is_none());
        }
        engine.on_price_event(&sample_event(Utc::now()), runner).await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let states = engine.states.read();
        let inner = states.get(&id).unwrap().inner.lock();
        assert!(inner.config.last_trigger_at.is_some());
        assert_eq!(inner.tick_counter, 0);
    }

    #[tokio::test]
    async fn interval_mode_respects_minimum_spacing() {
        let (_db, engine, id) = setup(TriggerMode::Interval);
        let runner = Arc::new(HoldRunner);
        let t0 = Utc::now();
        engine.on_price_event(&sample_event(t0), runner.clone()).await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let first_trigger = {
            let states = engine.states.read();
            states.get(&id).unwrap().inner.lock().config.last_trigger_at.clone()
        };
        assert!(first_trigger.is_some());

        // Second event 1s later should not re-trigger (interval=300s).
        engine.on_price_event(&sample_event(t0 + chrono::Duration::seconds(1)), runner).await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let second_trigger = {
            let states = engine.states.read();
            states.get(&id).unwrap().inner.lock().config.last_trigger_at.clone()
        };
        assert_eq!(first_trigger, second_trigger);
    }
}
