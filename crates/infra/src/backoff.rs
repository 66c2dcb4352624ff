//! Linear retry backoff with a delay ceiling and an attempt budget.
//!
//! [`BackoffPolicy`] is immutable configuration; every logical retried
//! operation calls [`BackoffPolicy::start`] and owns the resulting
//! [`Backoff`] tracker, so concurrent retry sequences never share a counter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// First delay handed out
    #[serde(with = "duration_millis")]
    pub min_delay: Duration,
    /// Maximum delay cap
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Number of delays handed out before STOP (0 = never retry)
    pub max_attempts: u32,
    /// Added to the delay after every attempt
    #[serde(with = "duration_millis")]
    pub step: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 3,
            step: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            min_delay,
            max_delay,
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// Fresh tracker for one logical operation.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempts: 0,
            next_delay: self.min_delay,
        }
    }

    /// Upper bound on the time a caller can spend sleeping in one retry sequence.
    pub fn worst_case_total(&self) -> Duration {
        let mut tracker = self.start();
        let mut total = Duration::ZERO;
        while let Some(delay) = tracker.next() {
            total += delay;
        }
        total
    }
}

/// Per-operation retry tracker.
///
/// Not shared: each retried call owns one.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
    next_delay: Duration,
}

impl Backoff {
    /// Next delay to sleep, or `None` (STOP) once the attempt budget is spent.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.next_delay.min(self.policy.max_delay);
        self.next_delay = self.next_delay.saturating_add(self.policy.step);
        Some(delay)
    }

    /// Start over from `min_delay` with a zero attempt count.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_delay = self.policy.min_delay;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
