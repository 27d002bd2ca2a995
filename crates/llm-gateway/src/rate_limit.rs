//! C4: per-key token bucket rate limiting.

use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

pub struct Admission {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch: u64,
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    window: Duration,
    last_refill: Instant,
    last_touched: Instant,
}

impl Bucket {
    fn new(capacity: u32, window: Duration) -> Self {
        let now = Instant::now();
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            window,
            last_refill: now,
            last_touched: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let rate = self.capacity / self.window.as_secs_f64().max(f64::MIN_POSITIVE);
        self.tokens = (self.tokens + elapsed * rate).min(self.capacity);
        self.last_refill = now;
    }

    fn admit(&mut self) -> Admission {
        let now = Instant::now();
        self.refill(now);
        self.last_touched = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;

            Admission {
                allowed: true,
                limit: self.capacity as u32,
                remaining: self.tokens.floor() as u32,
                reset_epoch: wall_clock_now(),
            }
        } else {
            let rate = self.capacity / self.window.as_secs_f64().max(f64::MIN_POSITIVE);
            let wait_secs = ((1.0 - self.tokens) / rate).ceil() as u64;

            Admission {
                allowed: false,
                limit: self.capacity as u32,
                remaining: 0,
                reset_epoch: wall_clock_now() + wait_secs,
            }
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_touched)
    }
}

fn wall_clock_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Sharded per-key token bucket map with a background reaper.
///
/// Operations on a single key are serialized through that key's `DashMap`
/// shard lock; distinct keys proceed independently.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { buckets: Arc::new(DashMap::new()) }
    }

    /// Admits one request for `api_key` against a bucket of the given `capacity`/`window`,
    /// constructing the bucket lazily (full) on first sighting of the key.
    pub fn admit(&self, api_key: &str, capacity: u32, window: Duration) -> Admission {
        let mut bucket = self
            .buckets
            .entry(api_key.to_string())
            .or_insert_with(|| Bucket::new(capacity, window));

        bucket.admit()
    }

    /// Evicts buckets untouched for more than `10 * window`. Intended to run on a
    /// fixed interval from a background task.
    pub fn reap_idle(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| bucket.idle_for(now) <= bucket.window * 10);
    }

    /// Spawns the periodic reaper on the current tokio runtime.
    pub fn spawn_reaper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                limiter.reap_idle();
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_is_admitted_and_decrements_one_token() {
        let limiter = RateLimiter::new();
        let admission = limiter.admit("sk-1", 2, Duration::from_secs(60));

        assert!(admission.allowed);
        assert_eq!(admission.remaining, 1);
        assert_eq!(admission.limit, 2);
    }

    #[test]
    fn exhausting_capacity_rejects_further_requests() {
        let limiter = RateLimiter::new();
        limiter.admit("sk-1", 2, Duration::from_secs(60));
        limiter.admit("sk-1", 2, Duration::from_secs(60));

        let third = limiter.admit("sk-1", 2, Duration::from_secs(60));
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
    }

    #[test]
    fn distinct_keys_have_independent_buckets() {
        let limiter = RateLimiter::new();
        limiter.admit("sk-1", 1, Duration::from_secs(60));

        let other_key = limiter.admit("sk-2", 1, Duration::from_secs(60));
        assert!(other_key.allowed);
    }

    #[test]
    fn reaper_evicts_only_long_idle_buckets() {
        let limiter = RateLimiter::new();
        limiter.admit("sk-1", 1, Duration::from_secs(60));
        limiter.reap_idle();

        // Freshly touched bucket survives a reap pass.
        assert!(limiter.buckets.contains_key("sk-1"));
    }
}
