//! Outbound connect failure tracking with exponential backoff

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

/// Backoff state of one peer
#[derive(Debug, Clone)]
pub struct Backoff {
    /// First delay after a failure
    initial: Duration,
    /// Largest delay
    max: Duration,
    /// Failures after which the peer counts as unreachable
    threshold: u32,
    /// Consecutive failures
    failures: u32,
    /// Earliest next attempt
    retry_at: Option<Instant>,
    /// Whether the unreachable transition was already logged
    interruption_reported: bool,
}

impl Backoff {
    /// Create a tracker
    pub fn new(initial: Duration, max: Duration, threshold: u32) -> Self {
        Self {
            initial,
            max,
            threshold: threshold.max(1),
            failures: 0,
            retry_at: None,
            interruption_reported: false,
        }
    }

    /// Record a failed attempt and return the delay before the next one
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.delay_for(self.failures);
        self.retry_at = Some(now + delay);

        if self.failures >= self.threshold && !self.interruption_reported {
            self.interruption_reported = true;
            warn!(failures = self.failures, "peer considered unreachable");
        }
        debug!(failures = self.failures, ?delay, "connect failure recorded");
        delay
    }

    /// Record a successful attempt. Returns true if the peer had been
    /// considered unreachable.
    pub fn reset(&mut self) -> bool {
        let was_unreachable = self.interruption_reported;
        if was_unreachable {
            debug!(failures = self.failures, "peer reachable again");
        }
        self.failures = 0;
        self.retry_at = None;
        self.interruption_reported = false;
        was_unreachable
    }

    /// Consecutive failures
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether enough attempts failed in a row to give up on queueing
    pub fn is_unreachable(&self) -> bool {
        self.failures >= self.threshold
    }

    /// Whether a new attempt may start at `now`
    pub fn may_retry(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }

    /// Delay for the `n`th consecutive failure: doubling from `initial`,
    /// capped at `max`, with up to a quarter of random jitter
    fn delay_for(&self, n: u32) -> Duration {
        let shift = n.saturating_sub(1).min(20);
        let base = self.initial.saturating_mul(1 << shift).min(self.max);
        let jitter = base / 4;
        if jitter.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter.as_micros() as u64);
        (base + Duration::from_micros(extra)).min(self.max)
    }
}
