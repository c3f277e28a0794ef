// =============================================================================
// Process-wide signed-request rate limiter
// =============================================================================
//
// A single spacing gate shared by every account: no two signed broker calls
// may start less than `min_interval` apart, no matter which account issued
// them. The lock is released for the duration of the sleep and reacquired
// immediately after, so a caller waiting out the spacing interval does not
// block unrelated callers from recording their own call time once their
// turn comes — this mirrors the source system's "release the lock, sleep,
// reacquire in a `finally`" pattern exactly.
// =============================================================================

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

pub struct RateLimiter {
    min_interval: Duration,
    last_call_at: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call_at: Mutex::new(None),
        }
    }

    /// Block until it is this caller's turn, then record the call time.
    ///
    /// Holds the lock only while computing the remaining wait and while
    /// recording the new call time — never while actually sleeping.
    pub async fn wait_turn(&self) {
        loop {
            let wait = {
                let guard = self.last_call_at.lock().await;
                match *guard {
                    None => None,
                    Some(last) => {
                        let elapsed = last.elapsed();
                        if elapsed >= self.min_interval {
                            None
                        } else {
                            Some(self.min_interval - elapsed)
                        }
                    }
                }
            };

            match wait {
                None => {
                    let mut guard = self.last_call_at.lock().await;
                    *guard = Some(Instant::now());
                    return;
                }
                Some(remaining) => {
                    info!(wait_ms = remaining.as_millis() as u64, "rate limiter spacing sleep");
                    tokio::time::sleep(remaining).await;
                    // Loop back around: recheck, since another caller may have
                    // taken their turn while we slept.
                }
            }
        }
    }
}
