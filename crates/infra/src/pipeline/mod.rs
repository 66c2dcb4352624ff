//! Order-processing pipeline.
//!
//! A fixed pool of workers drains a bounded intake of submitted orders, asks
//! the accrual authority for a verdict and, once the verdict is terminal,
//! finalizes the order through [`LedgerStorage::process_order`].
//!
//! ## Lanes
//!
//! New work arrives on the bounded intake ([`OrderQueue`]); producers are
//! back-pressured when it is full. Orders that need another pass go to an
//! unbounded retry lane after `repoll_delay`, so a worker never blocks on its
//! own intake. Workers prefer the retry lane.
//!
//! ## Failure budget
//!
//! Transient authority failures and failed finalizations count against
//! `max_poll_attempts`; once spent, the order is parked as a dead letter.
//! Non-terminal verdicts and rate limits do not count.
//!
//! [`LedgerStorage::process_order`]: crate::storage::LedgerStorage::process_order

mod gate;
pub mod queue;
pub mod types;
pub mod worker;

pub use queue::OrderQueue;
pub use types::{DeadLetterEntry, PipelineConfig, PipelineError, PipelineStats, QueuedOrder};
pub use worker::OrderPipeline;
