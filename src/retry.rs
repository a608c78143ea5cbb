//! Retry delay computation with exponential backoff and seeded jitter
//!
//! Delay for attempt n is `min(max_delay, base * factor^(n-1) + J)` where J
//! is drawn uniformly from ±(exponential * jitter_factor * 0.5). The RNG is
//! injectable so tests reproduce exact delay sequences.

use crate::types::{ErrorCategory, RetryPolicy};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;

/// Multiplier applied to computed delays at the resilience boundary
pub fn category_multiplier(category: ErrorCategory) -> f64 {
    match category {
        ErrorCategory::Timeout => 2.0,
        ErrorCategory::Resource => 1.5,
        ErrorCategory::Dependency => 0.5,
        _ => 1.0,
    }
}

/// Computes jittered backoff delays for retry attempts
pub struct RetryDelayCalculator {
    rng: Mutex<StdRng>,
}

impl RetryDelayCalculator {
    /// Calculator with entropy-seeded jitter
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Calculator with a fixed seed for reproducible delay sequences
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Delay before attempt `attempt` (1-based: attempt 1 is the first retry)
    pub fn delay_for_attempt(&self, policy: &RetryPolicy, attempt: u32) -> Duration {
        let base = policy.base_delay_ms as f64;
        let exponential = base * policy.backoff_factor.powi(attempt.saturating_sub(1) as i32);

        let jitter = if policy.jitter_factor > 0.0 {
            let band = exponential * policy.jitter_factor * 0.5;
            self.rng.lock().unwrap().gen_range(-band..=band)
        } else {
            0.0
        };

        let delay_ms = (exponential + jitter)
            .max(0.0)
            .min(policy.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Delay adjusted by the error-category multiplier, still capped
    pub fn delay_for_category(
        &self,
        policy: &RetryPolicy,
        attempt: u32,
        category: ErrorCategory,
    ) -> Duration {
        let raw = self.delay_for_attempt(policy, attempt).as_millis() as f64;
        let adjusted = (raw * category_multiplier(category)).min(policy.max_delay_ms as f64);
        Duration::from_millis(adjusted as u64)
    }
}

impl Default for RetryDelayCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether another attempt is permitted under `policy`
///
/// A task is retried iff the error is classified retryable, attempts so far
/// are below the budget, and the category is in the policy's retry set.
pub fn should_retry(
    policy: &RetryPolicy,
    attempts: u32,
    retryable: bool,
    category: ErrorCategory,
) -> bool {
    retryable && attempts < policy.max_attempts && policy.retry_on.contains(&category)
}
