//! Infrastructure layer: retry backoff, ledger storage, accrual authority
//! client and the order-processing pipeline.

pub mod accrual;
pub mod backoff;
pub mod pipeline;
pub mod storage;

pub use accrual::{AccrualClient, AccrualError, HttpAccrualClient};
pub use backoff::{Backoff, BackoffPolicy};
pub use pipeline::{OrderPipeline, OrderQueue, PipelineConfig, PipelineError, PipelineStats};
pub use storage::{
    InMemoryLedgerStorage, LedgerStorage, PostgresLedgerStorage, RetryingStorage, StorageError,
};
