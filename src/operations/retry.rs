//! Requeue delays for recoverable stage failures.

use std::time::Duration;

/// Smallest delay ever returned, so a failing stage never busy-loops.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long a failed stage waits before the next attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `base * 2^failures`, capped at `max`, multiplied by a factor in
    /// `[1 - jitter, 1 + jitter]`.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let delay = match self {
            RetryPolicy::Fixed(delay) => *delay,
            RetryPolicy::Exponential { base, max, jitter } => {
                let base_ms = base.as_millis() as u64;
                let exponential_ms = base_ms.saturating_mul(1u64 << failures.min(20));
                let capped_ms = exponential_ms.min(max.as_millis() as u64);
                Duration::from_millis(apply_jitter(capped_ms, *jitter, failures))
            }
        };
        delay.max(MIN_RETRY_DELAY)
    }
}

/// Hash-based jitter seeded from the clock and the attempt number.
fn apply_jitter(ms: u64, jitter: f64, attempt: u32) -> u64 {
    if jitter <= 0.0 {
        return ms;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0) as u64;
    let hash = now.wrapping_mul(31).wrapping_add(attempt as u64 * 17);
    let jitter_pct = ((hash % 1000) as f64 / 1000.0) * 2.0 - 1.0;
    let factor = 1.0 + jitter_pct * jitter.min(1.0);
    (ms as f64 * factor) as u64
}
