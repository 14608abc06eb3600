use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// Set by `force_drain_for` when the venue returns `Retry-After`; no
    /// tokens are handed out again until this instant passes.
    dead_until: Option<Instant>,
}

/// Token bucket rate limiter for one logical venue endpoint class.
///
/// `acquire` is a suspension point: callers queue on the internal mutex,
/// which resolves waiters in the order they started waiting, giving FIFO
/// ordering across concurrent callers of a single bucket. Capacity is
/// process-local; multi-process deployments coordinate some other way
/// (out of scope here).
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_rate: refill_rate_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                dead_until: None,
            }),
        }
    }

    /// 70% of the venue's documented market-discovery limit (200 / 10s).
    pub fn market_discovery() -> Self {
        Self::new(200.0, 20.0)
    }

    /// 70% of the venue's documented order-book read limit (1000 / 10s).
    pub fn orderbook_read() -> Self {
        Self::new(1000.0, 100.0)
    }

    fn refill(state: &mut BucketState, capacity: f64, refill_rate: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * refill_rate).min(capacity);
        state.last_refill = now;
    }

    /// Blocks until `n` tokens are available, then deducts them.
    ///
    /// Holds the bucket's internal lock for the whole wait instead of
    /// re-contending it between refill checks: tokio's `Mutex` grants the
    /// lock in the order it was requested, so holding it across the sleep
    /// gives concurrent waiters on one bucket a single FIFO queue rather
    /// than letting a later caller's shorter sleep win the next `lock()`
    /// race ahead of an earlier, still-waiting caller.
    pub async fn acquire(&self, n: f64) {
        let mut state = self.state.lock().await;

        loop {
            if let Some(dead_until) = state.dead_until {
                let now = Instant::now();
                if now < dead_until {
                    tokio::time::sleep(dead_until - now).await;
                    continue;
                }
                state.dead_until = None;
            }

            Self::refill(&mut state, self.capacity, self.refill_rate);

            if state.tokens >= n {
                state.tokens -= n;
                return;
            }

            let deficit = n - state.tokens;
            let wait_secs = deficit / self.refill_rate;
            tokio::time::sleep(Duration::from_secs_f64(wait_secs.max(0.001))).await;
        }
    }

    /// Forces a dead interval on the bucket for `duration`, honouring a
    /// venue-supplied `Retry-After` on a throttle response.
    pub async fn force_drain_for(&self, duration: Duration) {
        let mut state = self.state.lock().await;
        let until = Instant::now() + duration;
        state.dead_until = Some(match state.dead_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill_when_empty() {
        let bucket = TokenBucket::new(1.0, 1.0);
        bucket.acquire(1.0).await;

        let start = Instant::now();
        bucket.acquire(1.0).await;
        assert!(Instant::now() >= start);
    }

    #[tokio::test(start_paused = true)]
    async fn force_drain_blocks_until_duration_elapses() {
        let bucket = TokenBucket::new(10.0, 10.0);
        bucket.force_drain_for(Duration::from_secs(5)).await;

        let acquire = tokio::spawn(async move {
            bucket.acquire(1.0).await;
        });

        tokio::time::advance(Duration::from_secs(6)).await;
        acquire.await.unwrap();
    }
}
