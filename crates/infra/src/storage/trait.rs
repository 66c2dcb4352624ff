use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use loyalty_core::{Account, LedgerEntry, Order, OrderNumber, OrderStatus, UserId, Withdrawal};

/// Registration request. The password is already hashed by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub login: String,
    pub password_hash: String,
}

/// Stored credentials, returned by [`LedgerStorage::login`] for verification
/// by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub user_id: UserId,
    pub login: String,
    pub password_hash: String,
}

/// Storage operation error.
///
/// Only [`StorageError::Unavailable`] describes a transient condition
/// (connection refused/reset, pool exhausted, server shutting down). Every
/// other variant is a permanent business or integrity failure.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("order {0} is already finalized")]
    AlreadyFinalized(OrderNumber),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("{operation} failed after {attempts} retries: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Connection-class failure that is likely to succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    /// Innermost error, looking through retry wrappers.
    pub fn root(&self) -> &StorageError {
        match self {
            StorageError::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Persistence capability of the loyalty ledger.
///
/// ## Atomicity
///
/// `register`, `process_order` and `withdraw` touch several tables and must be
/// all-or-nothing. In particular an account's `balance` and `withdrawn` change
/// only inside `process_order`/`withdraw`, together with exactly one history
/// entry; no other path may read-modify-write a balance.
///
/// ## Idempotence
///
/// `process_order` refuses an order that is already terminal with
/// [`StorageError::AlreadyFinalized`], so a reward can never be credited twice.
#[async_trait::async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Create a user and its zero-balance account. Duplicate login → `Conflict`.
    async fn register(&self, user: &NewUser) -> Result<UserId, StorageError>;

    /// Look up stored credentials by login. Unknown login → `NotFound`.
    async fn login(&self, login: &str) -> Result<UserCredentials, StorageError>;

    async fn get_order_by_number(&self, number: &OrderNumber) -> Result<Order, StorageError>;

    /// Record a newly uploaded order. Duplicate number → `Conflict`.
    async fn add_order(&self, order: &Order) -> Result<(), StorageError>;

    /// Change the status of a non-terminal order without touching the balance.
    async fn update_order_status(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
    ) -> Result<(), StorageError>;

    /// Finalize an order: append the accrual history entry, credit the
    /// account and store the terminal status, in one transaction.
    async fn process_order(&self, order: &Order) -> Result<(), StorageError>;

    /// A user's orders, newest first.
    async fn list_orders(&self, user_id: UserId) -> Result<Vec<Order>, StorageError>;

    /// Every order that has not reached a terminal status, oldest first.
    async fn list_unfinished_orders(&self) -> Result<Vec<Order>, StorageError>;

    async fn get_account(&self, user_id: UserId) -> Result<Account, StorageError>;

    /// Spend points: append the withdrawal entry and debit the account in one
    /// transaction. Balance too low → `InsufficientFunds`.
    async fn withdraw(&self, user_id: UserId, withdrawal: &Withdrawal) -> Result<(), StorageError>;

    /// A user's withdrawals, newest first.
    async fn list_withdrawals(&self, user_id: UserId) -> Result<Vec<Withdrawal>, StorageError>;

    /// A user's full history, oldest first.
    async fn ledger_entries(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;

    async fn close(&self) -> Result<(), StorageError>;
}

#[async_trait::async_trait]
impl<S> LedgerStorage for Arc<S>
where
    S: LedgerStorage + ?Sized,
{
    async fn register(&self, user: &NewUser) -> Result<UserId, StorageError> {
        (**self).register(user).await
    }

    async fn login(&self, login: &str) -> Result<UserCredentials, StorageError> {
        (**self).login(login).await
    }

    async fn get_order_by_number(&self, number: &OrderNumber) -> Result<Order, StorageError> {
        (**self).get_order_by_number(number).await
    }

    async fn add_order(&self, order: &Order) -> Result<(), StorageError> {
        (**self).add_order(order).await
    }

    async fn update_order_status(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
    ) -> Result<(), StorageError> {
        (**self).update_order_status(number, status).await
    }

    async fn process_order(&self, order: &Order) -> Result<(), StorageError> {
        (**self).process_order(order).await
    }

    async fn list_orders(&self, user_id: UserId) -> Result<Vec<Order>, StorageError> {
        (**self).list_orders(user_id).await
    }

    async fn list_unfinished_orders(&self) -> Result<Vec<Order>, StorageError> {
        (**self).list_unfinished_orders().await
    }

    async fn get_account(&self, user_id: UserId) -> Result<Account, StorageError> {
        (**self).get_account(user_id).await
    }

    async fn withdraw(&self, user_id: UserId, withdrawal: &Withdrawal) -> Result<(), StorageError> {
        (**self).withdraw(user_id, withdrawal).await
    }

    async fn list_withdrawals(&self, user_id: UserId) -> Result<Vec<Withdrawal>, StorageError> {
        (**self).list_withdrawals(user_id).await
    }

    async fn ledger_entries(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, StorageError> {
        (**self).ledger_entries(user_id).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        (**self).ping().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        (**self).close().await
    }
}
