//! Retrying decorator over any [`LedgerStorage`].
//!
//! Every operation is invoked once; if it fails with an error the predicate
//! classifies as retryable, the same operation is re-invoked after each delay
//! handed out by a fresh [`Backoff`](crate::backoff::Backoff) tracker until it
//! succeeds, fails with a non-retryable error, or the tracker says STOP.
//! Non-retryable errors are returned unchanged, without sleeping.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use loyalty_core::{Account, LedgerEntry, Order, OrderNumber, OrderStatus, UserId, Withdrawal};

use super::r#trait::{LedgerStorage, NewUser, StorageError, UserCredentials};
use crate::backoff::BackoffPolicy;

/// Decides whether a failed storage call is worth repeating.
pub type RetryPredicate = Arc<dyn Fn(&StorageError) -> bool + Send + Sync>;

/// Storage decorator that retries transient failures with backoff.
pub struct RetryingStorage<S> {
    inner: S,
    policy: BackoffPolicy,
    predicate: RetryPredicate,
}

impl<S> RetryingStorage<S>
where
    S: LedgerStorage,
{
    /// Wrap an existing store, retrying only [`StorageError::is_transient`] errors.
    pub fn new(inner: S, policy: BackoffPolicy) -> Self {
        Self {
            inner,
            policy,
            predicate: Arc::new(StorageError::is_transient),
        }
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Build the inner store with `factory`, retrying it under the same
    /// discipline as every other operation. Exhausted retries or a
    /// non-retryable error fail construction.
    pub async fn connect<F, Fut>(
        policy: BackoffPolicy,
        predicate: RetryPredicate,
        factory: F,
    ) -> Result<Self, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<S, StorageError>>,
    {
        let inner = retry("connect", &policy, predicate.as_ref(), factory).await?;
        Ok(Self {
            inner,
            policy,
            predicate,
        })
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        retry(operation, &self.policy, self.predicate.as_ref(), f).await
    }
}

impl<S: fmt::Debug> fmt::Debug for RetryingStorage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingStorage")
            .field("inner", &self.inner)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

async fn retry<T, F, Fut>(
    operation: &'static str,
    policy: &BackoffPolicy,
    predicate: &(dyn Fn(&StorageError) -> bool + Send + Sync),
    mut f: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut backoff = policy.start();

    let result = loop {
        let err = match f().await {
            Ok(value) => break Ok(value),
            Err(err) if !predicate(&err) => break Err(err),
            Err(err) => err,
        };

        match backoff.next() {
            Some(delay) => {
                debug!(
                    operation,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying storage operation"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                warn!(
                    operation,
                    attempts = backoff.attempts(),
                    error = %err,
                    "storage retries exhausted"
                );
                break Err(StorageError::RetriesExhausted {
                    operation,
                    attempts: backoff.attempts(),
                    source: Box::new(err),
                });
            }
        }
    };

    backoff.reset();
    result
}

#[async_trait::async_trait]
impl<S> LedgerStorage for RetryingStorage<S>
where
    S: LedgerStorage,
{
    async fn register(&self, user: &NewUser) -> Result<UserId, StorageError> {
        let inner = &self.inner;
        self.run("register", move || inner.register(user)).await
    }

    async fn login(&self, login: &str) -> Result<UserCredentials, StorageError> {
        let inner = &self.inner;
        self.run("login", move || inner.login(login)).await
    }

    async fn get_order_by_number(&self, number: &OrderNumber) -> Result<Order, StorageError> {
        let inner = &self.inner;
        self.run("get_order_by_number", move || inner.get_order_by_number(number))
            .await
    }

    async fn add_order(&self, order: &Order) -> Result<(), StorageError> {
        let inner = &self.inner;
        self.run("add_order", move || inner.add_order(order)).await
    }

    async fn update_order_status(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
    ) -> Result<(), StorageError> {
        let inner = &self.inner;
        self.run("update_order_status", move || {
            inner.update_order_status(number, status)
        })
        .await
    }

    async fn process_order(&self, order: &Order) -> Result<(), StorageError> {
        let inner = &self.inner;
        self.run("process_order", move || inner.process_order(order)).await
    }

    async fn list_orders(&self, user_id: UserId) -> Result<Vec<Order>, StorageError> {
        let inner = &self.inner;
        self.run("list_orders", move || inner.list_orders(user_id)).await
    }

    async fn list_unfinished_orders(&self) -> Result<Vec<Order>, StorageError> {
        let inner = &self.inner;
        self.run("list_unfinished_orders", move || inner.list_unfinished_orders())
            .await
    }

    async fn get_account(&self, user_id: UserId) -> Result<Account, StorageError> {
        let inner = &self.inner;
        self.run("get_account", move || inner.get_account(user_id)).await
    }

    async fn withdraw(&self, user_id: UserId, withdrawal: &Withdrawal) -> Result<(), StorageError> {
        let inner = &self.inner;
        self.run("withdraw", move || inner.withdraw(user_id, withdrawal))
            .await
    }

    async fn list_withdrawals(&self, user_id: UserId) -> Result<Vec<Withdrawal>, StorageError> {
        let inner = &self.inner;
        self.run("list_withdrawals", move || inner.list_withdrawals(user_id))
            .await
    }

    async fn ledger_entries(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, StorageError> {
        let inner = &self.inner;
        self.run("ledger_entries", move || inner.ledger_entries(user_id))
            .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let inner = &self.inner;
        self.run("ping", move || inner.ping()).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::storage::InMemoryLedgerStorage;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10), max_attempts)
            .with_step(Duration::from_secs(2))
    }

    type Wrapped = RetryingStorage<Arc<InMemoryLedgerStorage>>;

    fn wrapped(max_attempts: u32) -> (Arc<InMemoryLedgerStorage>, Wrapped) {
        let inner = Arc::new(InMemoryLedgerStorage::new());
        let storage = RetryingStorage::new(Arc::clone(&inner), policy(max_attempts));
        (inner, storage)
    }

    #[tokio::test(start_paused = true)]
    async fn two_transient_failures_then_success() {
        let (inner, storage) = wrapped(5);
        inner.fail_next(StorageError::unavailable("connection refused"));
        inner.fail_next(StorageError::unavailable("connection refused"));

        let started = Instant::now();
        storage.ping().await.unwrap();

        assert_eq!(inner.call_count(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(1 + 3));

        // the next operation starts its schedule from min_delay again
        inner.fail_next(StorageError::unavailable("connection refused"));
        let started = Instant::now();
        storage.ping().await.unwrap();

        assert_eq!(inner.call_count(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_exhausts_the_attempt_budget() {
        let (inner, storage) = wrapped(3);
        for _ in 0..10 {
            inner.fail_next(StorageError::unavailable("connection reset"));
        }

        let started = Instant::now();
        let err = storage.ping().await.unwrap_err();

        match &err {
            StorageError::RetriesExhausted {
                operation,
                attempts,
                source,
            } => {
                assert_eq!(*operation, "ping");
                assert_eq!(*attempts, 3);
                assert!(source.is_transient());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.root().is_transient());
        assert_eq!(inner.call_count(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(1 + 3 + 5));
    }

    #[tokio::test(start_paused = true)]
    async fn constraint_violation_is_not_retried() {
        let (inner, storage) = wrapped(5);
        inner.fail_next(StorageError::conflict("duplicate key"));

        let started = Instant::now();
        let err = storage.ping().await.unwrap_err();

        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(inner.call_count(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_during_retry_stops_the_loop() {
        let (inner, storage) = wrapped(5);
        inner.fail_next(StorageError::unavailable("gone"));
        inner.fail_next(StorageError::not_found("order"));

        let err = storage.ping().await.unwrap_err();

        assert!(matches!(err, StorageError::NotFound(_)));
        assert_eq!(inner.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_predicate_controls_classification() {
        let (inner, storage) = wrapped(5);
        let storage = storage.with_predicate(Arc::new(|_: &StorageError| false));
        inner.fail_next(StorageError::unavailable("down"));

        assert!(storage.ping().await.is_err());
        assert_eq!(inner.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_use_independent_trackers() {
        let (inner, storage) = wrapped(2);
        let storage = Arc::new(storage);
        inner.fail_next(StorageError::unavailable("a"));
        inner.fail_next(StorageError::unavailable("b"));

        let (a, b) = tokio::join!(storage.ping(), storage.ping());

        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_the_factory() {
        let calls = AtomicU32::new(0);
        let storage = RetryingStorage::connect(
            policy(5),
            Arc::new(StorageError::is_transient),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StorageError::unavailable("database starting up"))
                    } else {
                        Ok(InMemoryLedgerStorage::new())
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        storage.ping().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connect_fails_on_permanent_error() {
        let result = RetryingStorage::<InMemoryLedgerStorage>::connect(
            policy(5),
            Arc::new(StorageError::is_transient),
            || async { Err(StorageError::Backend("bad credentials".to_string())) },
        )
        .await;

        assert!(matches!(result, Err(StorageError::Backend(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_fails_when_retries_run_out() {
        let result = RetryingStorage::<InMemoryLedgerStorage>::connect(
            policy(2),
            Arc::new(StorageError::is_transient),
            || async { Err(StorageError::unavailable("refused")) },
        )
        .await;

        assert!(matches!(
            result,
            Err(StorageError::RetriesExhausted { attempts: 2, .. })
        ));
    }
}
