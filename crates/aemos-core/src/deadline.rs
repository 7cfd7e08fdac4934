//! Monotonic deadlines for the event hot path.
//!
//! Every engine event carries a [`Deadline`]. The interpreter checks it at
//! node boundaries, data collection checks it around repository calls, and
//! workers check it before starting a chain. A deadline is a point on the
//! monotonic clock, so wall-clock adjustments never shorten or extend it.

use std::time::Duration;
use tokio::time::Instant;

/// A point in monotonic time by which work must complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    /// Deadline `timeout_ms` milliseconds from now.
    pub fn after_ms(timeout_ms: u64) -> Self {
        Self::after(Duration::from_millis(timeout_ms))
    }

    /// The underlying instant, for use with `tokio::time::timeout_at`.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Time remaining, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// A sub-deadline that is the earlier of this deadline and
    /// `timeout` from now. Used to bound data collection inside an
    /// event without outliving the event itself.
    pub fn bounded(&self, timeout: Duration) -> Deadline {
        let candidate = Instant::now() + timeout;
        Deadline {
            at: self.at.min(candidate),
        }
    }
}
