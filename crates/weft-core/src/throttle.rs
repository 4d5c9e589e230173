//! Log throttling for per-frame protocol errors.
//!
//! Protocol errors drop a single frame but can arrive in floods; the
//! contract is one log line per session per interval.

use std::time::{Duration, Instant};

/// Gate that opens at most once per interval.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    /// A gate opening at most once per `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// The conventional once-per-minute gate for protocol errors.
    #[must_use]
    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    /// Whether the caller may log now. Advances the window when it
    /// returns `true`.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            },
        }
    }
}
