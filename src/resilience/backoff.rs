//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Calculate exponential backoff delay with jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Spread a fixed period by up to `percent` in either direction.
pub fn jittered(period: Duration, percent: u64) -> Duration {
    let base = period.as_millis() as u64;
    let spread = base.saturating_mul(percent.min(100)) / 100;
    if spread == 0 {
        return period;
    }
    let offset = rand::thread_rng().gen_range(0..=spread * 2);
    Duration::from_millis(base - spread + offset)
}
