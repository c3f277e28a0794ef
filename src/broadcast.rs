// =============================================================================
// Subscription Broadcaster (C8)
// =============================================================================
//
// Fan-out point for everything downstream of the engine that wants a live
// feed for one account: trade fills, position changes, decisions, and
// periodic asset snapshots. Subscriber sinks are typed, non-blocking
// channels (`UnboundedSender<Value>`), not a callback list — a slow or
// gone subscriber can never block the engine, and a send failure removes
// that subscriber immediately rather than being silently swallowed.
//
// The first subscriber for an account starts a periodic snapshot job; the
// last unsubscribe aborts it via a stored `AbortHandle`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::types::AccountId;

/// Supplies the periodic per-account snapshot payload. Implemented by the
/// asset snapshot service (C7); kept as a trait here so the broadcaster does
/// not need to know about brokers, price caches, or SQLite.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot_for(&self, account_id: AccountId) -> Option<Value>;
}

struct AccountChannel {
    senders: Vec<UnboundedSender<Value>>,
    job: AbortHandle,
}

pub struct SubscriptionBroadcaster {
    channels: Mutex<HashMap<AccountId, AccountChannel>>,
    interval: Duration,
    provider: Arc<dyn SnapshotProvider>,
}

impl SubscriptionBroadcaster {
    pub fn new(interval: Duration, provider: Arc<dyn SnapshotProvider>) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            interval,
            provider,
        })
    }

    /// Subscribe to `account_id`'s feed. Starts the periodic snapshot job if
    /// this is the first subscriber for the account.
    pub fn subscribe(self: &Arc<Self>, account_id: AccountId) -> UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock();
        match channels.get_mut(&account_id) {
            Some(channel) => channel.senders.push(tx),
            None => {
                let job = self.spawn_snapshot_job(account_id);
                channels.insert(account_id, AccountChannel { senders: vec![tx], job });
                info!(%account_id, "started periodic snapshot job for first subscriber");
            }
        }
        rx
    }

    /// Drop every subscriber for `account_id` and stop its snapshot job.
    /// Mainly for tests and clean shutdown; in normal operation subscribers
    /// are pruned lazily as their sends fail.
    pub fn unsubscribe_all(&self, account_id: AccountId) {
        if let Some(channel) = self.channels.lock().remove(&account_id) {
            channel.job.abort();
        }
    }

    fn spawn_snapshot_job(self: &Arc<Self>, account_id: AccountId) -> AbortHandle {
        let this = Arc::clone(self);
        let interval = this.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it, the caller gets a live feed, not a stale replay
            loop {
                ticker.tick().await;
                if let Some(snapshot) = this.provider.snapshot_for(account_id).await {
                    this.broadcast(account_id, snapshot);
                } else {
                    debug!(%account_id, "snapshot provider had nothing to report this tick");
                }
            }
        });
        handle.abort_handle()
    }

    fn broadcast(&self, account_id: AccountId, payload: Value) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(&account_id) else {
            return;
        };
        channel.senders.retain(|tx| tx.send(payload.clone()).is_ok());
        if channel.senders.is_empty() {
            channel.job.abort();
            channels.remove(&account_id);
            info!(%account_id, "last subscriber gone, stopped snapshot job");
        }
    }

    /// Broadcast a trade execution update. A no-op if nobody is subscribed.
    pub fn broadcast_trade(&self, account_id: AccountId, payload: Value) {
        self.broadcast_if_subscribed(account_id, "trade", payload);
    }

    /// Broadcast a position change. A no-op if nobody is subscribed.
    pub fn broadcast_position(&self, account_id: AccountId, payload: Value) {
        self.broadcast_if_subscribed(account_id, "position", payload);
    }

    /// Broadcast a decision outcome. A no-op if nobody is subscribed.
    pub fn broadcast_decision(&self, account_id: AccountId, payload: Value) {
        self.broadcast_if_subscribed(account_id, "decision", payload);
    }

    fn broadcast_if_subscribed(&self, account_id: AccountId, kind: &str, payload: Value) {
        let has_subscribers = self.channels.lock().contains_key(&account_id);
        if !has_subscribers {
            return;
        }
        let envelope = serde_json::json!({"kind": kind, "payload": payload});
        self.broadcast(account_id, envelope);
    }

    pub fn subscriber_count(&self, account_id: AccountId) -> usize {
        self.channels.lock().get(&account_id).map(|c| c.senders.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SnapshotProvider for CountingProvider {
        async fn snapshot_for(&self, _account_id: AccountId) -> Option<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(serde_json::json!({"total_assets": 100.0}))
        }
    }

    struct NoopProvider;
    #[async_trait]
    impl SnapshotProvider for NoopProvider {
        async fn snapshot_for(&self, _account_id: AccountId) -> Option<Value> {
            None
        }
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_a_silent_no_op() {
        let broadcaster = SubscriptionBroadcaster::new(Duration::from_secs(30), Arc::new(NoopProvider));
        broadcaster.broadcast_trade(AccountId(1), serde_json::json!({"x": 1}));
        assert_eq!(broadcaster.subscriber_count(AccountId(1)), 0);
    }

    #[tokio::test]
    async fn subscribe_then_broadcast_delivers_to_the_receiver() {
        let broadcaster = SubscriptionBroadcaster::new(Duration::from_secs(30), Arc::new(NoopProvider));
        let mut rx = broadcaster.subscribe(AccountId(1));
        broadcaster.broadcast_trade(AccountId(1), serde_json::json!({"order_id": "abc"}));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["kind"], "trade");
    }

    #[tokio::test]
    async fn dropping_the_receiver_prunes_the_subscriber_on_next_send() {
        let broadcaster = SubscriptionBroadcaster::new(Duration::from_secs(30), Arc::new(NoopProvider));
        let rx = broadcaster.subscribe(AccountId(1));
        drop(rx);
        broadcaster.broadcast_trade(AccountId(1), serde_json::json!({"x": 1}));
        assert_eq!(broadcaster.subscriber_count(AccountId(1)), 0);
    }

    #[tokio::test]
    async fn periodic_job_calls_the_provider_after_subscribing() {
        tokio::time::pause();
        let calls = Arc::new(AtomicUsize::new(0));
        let broadcaster = SubscriptionBroadcaster::new(Duration::from_secs(10), Arc::new(CountingProvider { calls: calls.clone() }));
        let mut rx = broadcaster.subscribe(AccountId(1));

        tokio::time::advance(Duration::from_secs(11)).await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["payload"]["total_assets"], 100.0);
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
