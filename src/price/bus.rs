// =============================================================================
// Price Event Bus (part of C3)
// =============================================================================
//
// A synchronous pub/sub bus: each `PriceEvent` is dispatched to every
// subscribed handler, in subscription order, before `publish` returns. A
// handler that panics is caught at the dispatch site so a single bad
// handler cannot prevent the remaining handlers from observing the event.
// Handlers that need to do real work dispatch it to their own worker
// (task, channel, thread pool) rather than blocking here — that is on the
// handler, not the bus.
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::error;

/// A single price observation published by the market stream.
#[derive(Debug, Clone)]
pub struct PriceEvent {
    pub symbol: String,
    pub venue: String,
    pub price: f64,
    pub event_time: DateTime<Utc>,
}

pub type PriceHandler = Arc<dyn Fn(&PriceEvent) + Send + Sync>;

/// Opaque handle returned by `subscribe`, used to `unsubscribe` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: PriceHandler,
}

#[derive(Default)]
pub struct PriceEventBus {
    handlers: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl PriceEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`, invoked on every subsequent `publish` in
    /// subscription order. Returns an id usable with `unsubscribe`.
    pub fn subscribe(&self, handler: PriceHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.handlers.write().push(Subscription { id, handler });
        id
    }

    /// Remove a previously registered handler. A no-op if the id is unknown
    /// (already unsubscribed).
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.handlers.write().retain(|s| s.id != id);
    }

    /// Dispatch `event` to every subscriber synchronously, in subscription
    /// order. Handler panics are caught and logged; they never escape
    /// `publish` or suppress later handlers.
    pub fn publish(&self, event: PriceEvent) {
        let handlers: Vec<PriceHandler> = self.handlers.read().iter().map(|s| s.handler.clone()).collect();
        for handler in handlers.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if result.is_err() {
                error!(symbol = %event.symbol, "price event handler panicked");
            }
        }
    }
}
