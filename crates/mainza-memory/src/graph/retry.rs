//! Exponential backoff with jitter for transient graph failures.

use rand::Rng;
use std::time::Duration;

use super::transport::FailureKind;
use crate::config::RetryConfig;

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    // Use saturating multiplication to avoid overflow
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter {
        // Add random jitter (0-50% of delay)
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.5);
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Delay before the next attempt, or `None` when the failure must surface now
pub fn next_delay(kind: FailureKind, attempt: u32, config: &RetryConfig) -> Option<Duration> {
    if attempt + 1 >= config.max_attempts {
        return None;
    }
    match kind {
        FailureKind::Permanent => None,
        FailureKind::Transient => Some(calculate_delay(attempt, config)),
        // Rate limited: wait the full cap
        FailureKind::RateLimited => Some(Duration::from_millis(config.max_delay_ms)),
    }
}
