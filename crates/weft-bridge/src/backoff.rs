//! Exponential backoff for reconnection delays.
//!
//! Delay doubles on each consecutive failure, capped at the configured
//! maximum, with ±20% jitter: `delay = min(cap, base * 2^attempt) *
//! random(0.8..=1.2)`. The session resets the counter after a
//! connection that stayed open long enough to count as a success.

use std::time::Duration;

/// Jitter bounds, in permille of the nominal delay.
const JITTER_LO: u64 = 800;
const JITTER_HI: u64 = 1200;

/// Exponential backoff calculator.
pub(crate) struct Backoff {
    /// Base delay in milliseconds.
    base_ms: u64,
    /// Maximum delay cap in milliseconds.
    max_ms: u64,
    /// Current attempt number (0-indexed).
    attempt: u32,
}

impl Backoff {
    /// Create a new backoff calculator.
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_ms: u64::try_from(base.as_millis()).unwrap_or(u64::MAX),
            max_ms: u64::try_from(max.as_millis()).unwrap_or(u64::MAX),
            attempt: 0,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = self
            .base_ms
            .saturating_mul(1u64.checked_shl(self.attempt).unwrap_or(u64::MAX));
        let capped = exp.min(self.max_ms);
        let factor = fastrand::u64(JITTER_LO..=JITTER_HI);
        // Safety: divisor is a non-zero constant; the product is capped
        // by saturating_mul.
        #[allow(clippy::arithmetic_side_effects)]
        let jittered = capped.saturating_mul(factor) / 1000;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(jittered)
    }

    /// Reset the attempt counter after a successful connection.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}
