//! Exponential backoff for failing work-queue keys.
//!
//! Each key tracks its own count of consecutive failures. The delay before the
//! next attempt doubles with every failure up to a cap, and a success resets
//! the key to the base delay.
//!
//! # Example
//!
//! ```ignore
//! use service_catalog::retry::{BackoffConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(BackoffConfig::default());
//! let delay = limiter.when(&key); // 5ms, 10ms, 20ms, ... capped at 1000s
//! limiter.forget(&key);
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;

/// Backoff policy for requeued keys
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_multiplier: f64,
    /// Consecutive failures after which a key is reported as exhausted.
    /// Exhausted keys keep retrying at `max_delay`.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_multiplier: 2.0,
            max_attempts: 15,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `failures` (0-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(failures.min(64) as i32);
        let nanos = self.initial_delay.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos.round() as u64)
        }
    }
}

/// Per-key failure tracking
#[derive(Debug)]
pub struct RateLimiter<K> {
    config: BackoffConfig,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Clone + Eq + Hash> RateLimiter<K> {
    /// Create a limiter with the given policy
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = self.config.delay_for(*count);
        *count = count.saturating_add(1);
        delay
    }

    /// Consecutive failures recorded for `key`
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }

    /// True once `key` failed at least `max_attempts` times in a row
    pub fn is_exhausted(&self, key: &K) -> bool {
        self.config.max_attempts > 0 && self.num_requeues(key) >= self.config.max_attempts
    }

    /// Reset `key` to the base delay
    pub fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    /// Backoff policy in use
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}
