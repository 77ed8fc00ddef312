//! Rate limiter.
//!
//! Corresponds to spec.md §4.2 step 3 and §3's `RateBucket` row: two
//! sliding counters per client (hourly, per-minute burst), advisory
//! accuracy, in-memory, evicted when idle. Grounded on `dashmap`'s
//! sharded-map idiom — each client gets independent fine-grained
//! exclusion, matching spec.md §5 "Rate-limit buckets use per-client
//! fine-grained mutual exclusion (sharded)".

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Sliding window of request timestamps, pruned on each check.
struct Window {
    events: Vec<Instant>,
}

impl Window {
    fn new() -> Self {
        Self { events: Vec::new() }
    }

    fn prune_and_count(&mut self, now: Instant, span: Duration) -> usize {
        self.events.retain(|t| now.duration_since(*t) < span);
        self.events.len()
    }

    fn record(&mut self, now: Instant) {
        self.events.push(now);
    }
}

struct Bucket {
    minute: Window,
    hour: Window,
    block_until: Option<Instant>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            minute: Window::new(),
            hour: Window::new(),
            block_until: None,
        }
    }
}

pub struct RateLimiter {
    buckets: DashMap<String, Mutex<Bucket>>,
    per_minute: u32,
    per_hour: u32,
    block_duration: Duration,
}

/// Outcome of a rate-limit check.
pub enum RateDecision {
    Admit,
    Blocked { retry_after: Duration },
}

impl RateLimiter {
    pub fn new(per_minute: u32, per_hour: u32, block_duration: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            per_minute,
            per_hour,
            block_duration,
        }
    }

    /// Check-and-record for one request from `client_id`. Mirrors
    /// spec.md §4.2: exceeding either window sets `block_until` and
    /// rejects until it elapses.
    pub fn check(&self, client_id: &str) -> RateDecision {
        let now = Instant::now();
        let entry = self
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| Mutex::new(Bucket::new()));
        let mut bucket = entry.lock();

        if let Some(until) = bucket.block_until {
            if now < until {
                return RateDecision::Blocked {
                    retry_after: until - now,
                };
            }
            bucket.block_until = None;
        }

        let minute_count = bucket.minute.prune_and_count(now, Duration::from_secs(60));
        let hour_count = bucket.hour.prune_and_count(now, Duration::from_secs(3600));

        if minute_count >= self.per_minute as usize || hour_count >= self.per_hour as usize {
            bucket.block_until = Some(now + self.block_duration);
            return RateDecision::Blocked {
                retry_after: self.block_duration,
            };
        }

        bucket.minute.record(now);
        bucket.hour.record(now);
        RateDecision::Admit
    }

    /// Drop buckets that have had no activity and no active block for
    /// longer than the hour window, per spec.md §3 "evicted when idle
    /// past window".
    pub fn evict_idle(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            let bucket = bucket.lock();
            if let Some(until) = bucket.block_until {
                if now < until {
                    return true;
                }
            }
            bucket
                .hour
                .events
                .last()
                .map(|t| now.duration_since(*t) < Duration::from_secs(3600))
                .unwrap_or(false)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eleventh_request_in_a_minute_is_rate_limited() {
        let limiter = RateLimiter::new(10, 100, Duration::from_secs(3600));
        for _ in 0..10 {
            assert!(matches!(limiter.check("client-a"), RateDecision::Admit));
        }
        assert!(matches!(limiter.check("client-a"), RateDecision::Blocked { .. }));
    }

    #[test]
    fn hundred_and_first_request_in_an_hour_is_rate_limited() {
        let limiter = RateLimiter::new(1000, 100, Duration::from_secs(3600));
        for _ in 0..100 {
            assert!(matches!(limiter.check("client-b"), RateDecision::Admit));
        }
        assert!(matches!(limiter.check("client-b"), RateDecision::Blocked { .. }));
    }

    #[test]
    fn different_clients_have_independent_buckets() {
        let limiter = RateLimiter::new(1, 100, Duration::from_secs(3600));
        assert!(matches!(limiter.check("a"), RateDecision::Admit));
        assert!(matches!(limiter.check("b"), RateDecision::Admit));
    }
}
