// =============================================================================
// Price Cache (part of C3)
// =============================================================================
//
// TTL-bounded last-price cache plus a rolling history window, keyed by
// symbol. Matches the original price cache's two defaults exactly: a 30s
// cache TTL and a 3600s (1h) history retention window. The cache entry and
// its history share one lock since every write touches both together.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    price: f64,
    recorded_at: Instant,
}

struct Inner {
    cache: HashMap<String, CacheEntry>,
    history: HashMap<String, VecDeque<(Instant, f64)>>,
}

pub struct PriceCache {
    ttl: Duration,
    history_window: Duration,
    inner: Mutex<Inner>,
}

impl PriceCache {
    pub fn new(ttl: Duration, history_window: Duration) -> Self {
        Self {
            ttl,
            history_window,
            inner: Mutex::new(Inner {
                cache: HashMap::new(),
                history: HashMap::new(),
            }),
        }
    }

    /// Return the cached price for `symbol` if present and not expired.
    /// Lazily purges the entry if it has expired.
    pub fn get(&self, symbol: &str) -> Option<f64> {
        let mut inner = self.inner.lock();
        let expired = match inner.cache.get(symbol) {
            Some(entry) => entry.recorded_at.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            inner.cache.remove(symbol);
            return None;
        }
        inner.cache.get(symbol).map(|e| e.price)
    }

    /// Record a new price observation for `symbol`, updating both the cache
    /// and the rolling history, trimming history entries older than the
    /// retention window.
    pub fn record(&self, symbol: &str, price: f64) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.cache.insert(
            symbol.to_string(),
            CacheEntry {
                price,
                recorded_at: now,
            },
        );

        let history_window = self.history_window;
        let history = inner.history.entry(symbol.to_string()).or_default();
        history.push_back((now, price));
        while let Some((ts, _)) = history.front() {
            if now.duration_since(*ts) > history_window {
                history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Sweep all cache entries and history windows, removing anything
    /// expired. Intended to be called periodically by the market stream.
    pub fn clear_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let ttl = self.ttl;
        inner.cache.retain(|_, entry| now.duration_since(entry.recorded_at) < ttl);
        let history_window = self.history_window;
        for deque in inner.history.values_mut() {
            while let Some((ts, _)) = deque.front() {
                if now.duration_since(*ts) > history_window {
                    deque.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Return the rolling history for `symbol` as `(seconds_ago, price)`
    /// pairs, oldest first.
    pub fn history(&self, symbol: &str) -> Vec<(f64, f64)> {
        let inner = self.inner.lock();
        let now = Instant::now();
        inner
            .history
            .get(symbol)
            .map(|deque| {
                deque
                    .iter()
                    .map(|(ts, price)| (now.duration_since(*ts).as_secs_f64(), *price))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn record_then_get_returns_the_price() {
        let cache = PriceCache::new(Duration::from_secs(30), Duration::from_secs(3600));
        cache.record("BTC", 65000.0);
        assert_eq!(cache.get("BTC"), Some(65000.0));
    }

    #[test]
    fn get_on_unknown_symbol_returns_none() {
        let cache = PriceCache::new(Duration::from_secs(30), Duration::from_secs(3600));
        assert_eq!(cache.get("ETH"), None);
    }

    #[test]
    fn expired_entry_is_purged_on_read() {
        let cache = PriceCache::new(Duration::from_millis(10), Duration::from_secs(3600));
        cache.record("BTC", 65000.0);
        std::thread::sleep(StdDuration::from_millis(30));
        assert_eq!(cache.get("BTC"), None);
    }

    #[test]
    fn history_accumulates_multiple_observations() {
        let cache = PriceCache::new(Duration::from_secs(30), Duration::from_secs(3600));
        cache.record("BTC", 65000.0);
        cache.record("BTC", 65100.0);
        let history = cache.history("BTC");
        assert_eq!(history.len(), 2);
    }
}
