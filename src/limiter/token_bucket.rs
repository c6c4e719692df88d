use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::RateLimiter;

struct Bucket {
    tokens: u64,
    last_check: Instant,
}

/// In-memory token buckets, one per identifier, created full on first
/// access. Refill is `floor(elapsed_seconds * refill_rate)` tokens, capped
/// at capacity; `last_check` only advances when at least one token was
/// refilled so fractional progress is never lost.
///
/// One mutex covers the identifier map and every bucket in it.
pub struct MemoryTokenBucket {
    name: String,
    capacity: u64,
    refill_rate: u64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl MemoryTokenBucket {
    pub fn new(name: impl Into<String>, capacity: u64, refill_rate: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn allow_at(&self, identifier: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();

        let bucket = buckets.entry(identifier.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_check: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_check);
        let refill = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;
        if refill > 0 {
            bucket.tokens = (bucket.tokens + refill).min(self.capacity);
            bucket.last_check = now;
        }

        if bucket.tokens >= 1 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    fn sweep_at(&self, idle_for: Duration, now: Instant) {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_check) < idle_for);
        let dropped = before - buckets.len();
        if dropped > 0 {
            debug!(rule = %self.name, dropped, remaining = buckets.len(),
                "swept idle token buckets");
        }
    }

    #[cfg(test)]
    fn tokens(&self, identifier: &str) -> Option<u64> {
        self.buckets.lock().get(identifier).map(|b| b.tokens)
    }
}

impl RateLimiter for MemoryTokenBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn allow(&self, identifier: &str) -> bool {
        self.allow_at(identifier, Instant::now())
    }

    fn sweep(&self, idle_for: Duration) {
        self.sweep_at(idle_for, Instant::now());
    }
}
