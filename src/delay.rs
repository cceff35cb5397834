//! Negative-acknowledgement delay policies
//!
//! A `Delay` maps the broker's redelivery counter to the wait applied
//! before the message is redelivered. Returning [`STOP_TIME`] terminates
//! delivery of the message instead.

use std::sync::Arc;
use std::time::Duration;

/// Sentinel wait time meaning "terminate the message; do not redeliver"
pub const STOP_TIME: Duration = Duration::MAX;

/// Policy mapping a redelivery count to a pre-redelivery wait
///
/// `num_delivered` is at least 1 (the first attempt). A zero duration
/// means "negative-ack immediately"; [`STOP_TIME`] means terminate.
pub trait Delay: Send + Sync {
    fn wait_time(&self, num_delivered: u64) -> Duration;
}

/// Fixed wait regardless of the redelivery count
#[derive(Debug, Clone, Copy)]
pub struct StaticDelay(pub Duration);

impl Delay for StaticDelay {
    fn wait_time(&self, _num_delivered: u64) -> Duration {
        self.0
    }
}

/// Per-attempt wait table; attempts past the end reuse the last entry
///
/// An empty table behaves like an immediate nak.
#[derive(Debug, Clone, Default)]
pub struct BackoffDelay {
    steps: Vec<Duration>,
}

impl BackoffDelay {
    pub fn new(steps: Vec<Duration>) -> Self {
        Self { steps }
    }
}

impl Delay for BackoffDelay {
    fn wait_time(&self, num_delivered: u64) -> Duration {
        if self.steps.is_empty() {
            return Duration::ZERO;
        }
        let idx = (num_delivered.max(1) as usize - 1).min(self.steps.len() - 1);
        self.steps[idx]
    }
}

/// Caps delivery attempts, terminating the message past the ceiling
///
/// Delegates to the inner policy until `max_attempts` deliveries have
/// happened, then returns [`STOP_TIME`].
#[derive(Clone)]
pub struct MaxAttemptsDelay {
    inner: Arc<dyn Delay>,
    max_attempts: u64,
}

impl MaxAttemptsDelay {
    pub fn new(inner: Arc<dyn Delay>, max_attempts: u64) -> Self {
        Self {
            inner,
            max_attempts,
        }
    }
}

impl Delay for MaxAttemptsDelay {
    fn wait_time(&self, num_delivered: u64) -> Duration {
        if num_delivered >= self.max_attempts {
            return STOP_TIME;
        }
        self.inner.wait_time(num_delivered)
    }
}
