//! # Exponential Backoff
//!
//! Per-key exponential backoff used by the work queues. Each consecutive
//! failure of the same key doubles its delay, starting at `base` and capped
//! at `max`. A successful reconciliation forgets the key.
//!
//! Default schedule for reconciliation errors: 5ms, 10ms, 20ms, ... 1000s (max).

use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

/// Default delay after the first failure
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Default delay ceiling
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator
///
/// Each backoff is twice the previous one, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: 0 }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = Self::calculate_for_failures(self.failures, self.base, self.max);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Number of backoffs handed out since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Stateless delay for the given number of prior failures
    #[must_use]
    pub fn calculate_for_failures(failures: u32, base: Duration, max: Duration) -> Duration {
        // 2^31 * base overflows long before it matters; clamp the exponent
        let factor = 1u64 << failures.min(31);
        let nanos = base.as_nanos().saturating_mul(u128::from(factor));
        if nanos >= max.as_nanos() {
            max
        } else {
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }
}

/// Per-key failure tracking for a work queue
#[derive(Debug)]
pub struct ItemRateLimiter {
    base: Duration,
    max: Duration,
    items: HashMap<String, ExponentialBackoff>,
}

impl Default for ItemRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl ItemRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            items: HashMap::new(),
        }
    }

    /// Delay before `key` may be processed again, advancing its failure count
    pub fn when(&mut self, key: &str) -> Duration {
        let (base, max) = (self.base, self.max);
        self.items
            .entry(key.to_string())
            .or_insert_with(|| ExponentialBackoff::new(base, max))
            .next_backoff()
    }

    /// Stop tracking `key`; its next failure starts from `base` again
    pub fn forget(&mut self, key: &str) {
        self.items.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.items.get(key).map_or(0, ExponentialBackoff::failures)
    }
}

/// Spread `delay` by up to `factor` of itself, e.g. 0.1 gives `[d, 1.1d)`
pub fn jittered(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let mut rng = rand::thread_rng();
    let extra = rng.r#gen::<f64>() * factor * delay.as_secs_f64();
    delay + Duration::from_secs_f64(extra)
}
