//! Shared rate-limiting and sizing configuration.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Static sizing/throughput limits, typically loaded from the launcher's
/// configuration record and threaded down into each connection runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    pub max_connections: usize,
    pub max_message_bytes: usize,
    pub requests_per_second: Option<u32>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_message_bytes: 10 * 1024 * 1024,
            requests_per_second: None,
        }
    }
}

/// A token-bucket rate limiter. `None` capacity in `Limits::requests_per_second`
/// means unlimited; callers should skip constructing a `RateLimiter` in that case.
pub struct RateLimiter {
    capacity: u64,
    tokens: AtomicU64,
    refill_per_sec: u64,
    last_refill: parking_lot::Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        let capacity = requests_per_second.max(1) as u64;
        Self {
            capacity,
            tokens: AtomicU64::new(capacity),
            refill_per_sec: capacity,
            last_refill: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Attempt to take one token. Returns `false` if the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        self.refill();
        loop {
            let current = self.tokens.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            if self
                .tokens
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let elapsed = last.elapsed();
        if elapsed < Duration::from_millis(50) {
            return;
        }
        let refill_amount = (elapsed.as_secs_f64() * self.refill_per_sec as f64) as u64;
        if refill_amount > 0 {
            let mut current = self.tokens.load(Ordering::Acquire);
            loop {
                let new_value = (current + refill_amount).min(self.capacity);
                match self
                    .tokens
                    .compare_exchange(current, new_value, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
            *last = Instant::now();
        }
    }
}
