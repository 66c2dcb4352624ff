use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use loyalty_core::{Order, OrderNumber};

use crate::backoff::duration_millis;

/// Pipeline tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the bounded intake
    pub queue_capacity: usize,
    /// Pause before an order goes back on the retry lane
    #[serde(with = "duration_millis")]
    pub repoll_delay: Duration,
    /// Failed passes before an order is dead-lettered (`None` = never)
    pub max_poll_attempts: Option<u32>,
    /// Log repeated failures of one order at `warn` every N attempts
    pub warn_every: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            repoll_delay: Duration::from_secs(1),
            max_poll_attempts: Some(100),
            warn_every: 10,
        }
    }
}

/// An order waiting for its next pass, with the failures it has accumulated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedOrder {
    pub order: Order,
    pub attempts: u32,
}

impl QueuedOrder {
    pub fn new(order: Order) -> Self {
        Self { order, attempts: 0 }
    }
}

/// An order parked after exhausting its failure budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub order: Order,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(order: Order, attempts: u32, reason: String) -> Self {
        Self {
            order,
            attempts,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("order queue is full")]
    Full,

    #[error("order pipeline is closed")]
    Closed,

    #[error("order {0} is already final")]
    AlreadyFinal(OrderNumber),

    #[error("order {0} is not dead-lettered")]
    NotDeadLettered(OrderNumber),
}

/// Pipeline runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub polled: u64,
    pub requeued: u64,
    pub processed: u64,
    pub invalid: u64,
    pub rate_limited: u64,
    pub finalize_failures: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub polled: AtomicU64,
    pub requeued: AtomicU64,
    pub processed: AtomicU64,
    pub invalid: AtomicU64,
    pub rate_limited: AtomicU64,
    pub finalize_failures: AtomicU64,
    pub dead_lettered: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            polled: self.polled.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            finalize_failures: self.finalize_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.max_poll_attempts, Some(100));
    }

    #[test]
    fn config_deserializes_with_millis() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"queue_capacity":8,"repoll_delay":250,"max_poll_attempts":null,"warn_every":5}"#,
        )
        .unwrap();

        assert_eq!(config.repoll_delay, Duration::from_millis(250));
        assert_eq!(config.max_poll_attempts, None);
    }

    #[test]
    fn counters_snapshot() {
        let counters = StatsCounters::default();
        StatsCounters::bump(&counters.polled);
        StatsCounters::bump(&counters.polled);
        StatsCounters::bump(&counters.dead_lettered);

        let stats = counters.snapshot();
        assert_eq!(stats.polled, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.processed, 0);
    }
}
