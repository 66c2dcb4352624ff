//! Postgres-backed ledger storage.
//!
//! ## Error Mapping
//!
//! | SQLx error | SQLSTATE | StorageError |
//! |------------|----------|--------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (connection exception) | `08xxx` | `Unavailable` |
//! | Database (admin/crash shutdown) | `57P01`..`57P03` | `Unavailable` |
//! | Database (too many connections) | `53300` | `Unavailable` |
//! | Io / Tls / PoolTimedOut | N/A | `Unavailable` |
//! | RowNotFound | N/A | `NotFound` |
//! | anything else | any | `Backend` |
//!
//! Only the `Unavailable` rows are retried by
//! [`RetryingStorage`](super::RetryingStorage).
//!
//! ## Atomicity
//!
//! `register`, `process_order` and `withdraw` run in a single transaction. The
//! order row is locked with `FOR UPDATE` before it is finalized, so two
//! concurrent finalizations of one order serialize and the loser observes a
//! terminal status.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use loyalty_core::{
    Account, EntryKind, LedgerEntry, Order, OrderNumber, OrderStatus, Points, UserId, Withdrawal,
};

use super::r#trait::{LedgerStorage, NewUser, StorageError, UserCredentials};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id            UUID PRIMARY KEY,
    login         TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts (
    user_id   UUID PRIMARY KEY REFERENCES users (id),
    balance   BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
    withdrawn BIGINT NOT NULL DEFAULT 0 CHECK (withdrawn >= 0)
);

CREATE TABLE IF NOT EXISTS orders (
    number      TEXT PRIMARY KEY,
    user_id     UUID NOT NULL REFERENCES users (id),
    status      TEXT NOT NULL,
    accrual     BIGINT,
    uploaded_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS orders_unfinished_idx
    ON orders (uploaded_at) WHERE status NOT IN ('INVALID', 'PROCESSED');

CREATE TABLE IF NOT EXISTS history (
    id           BIGSERIAL PRIMARY KEY,
    user_id      UUID NOT NULL REFERENCES users (id),
    order_number TEXT NOT NULL,
    kind         TEXT NOT NULL CHECK (kind IN ('accrual', 'withdrawn')),
    amount       BIGINT NOT NULL CHECK (amount >= 0),
    recorded_at  TIMESTAMPTZ NOT NULL,
    UNIQUE (order_number, kind)
);
"#;

/// Postgres-backed ledger storage.
///
/// Amounts are stored as `BIGINT` hundredths; see [`Points`].
#[derive(Debug, Clone)]
pub struct PostgresLedgerStorage {
    pool: PgPool,
}

impl PostgresLedgerStorage {
    /// Wrap an existing pool. The schema is assumed to be in place.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool for `dsn` and apply the schema.
    #[instrument(skip(dsn), err)]
    pub async fn connect(dsn: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(dsn)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("apply_schema", e))?;

        Ok(Self::new(pool))
    }
}

#[async_trait::async_trait]
impl LedgerStorage for PostgresLedgerStorage {
    #[instrument(skip(self, user), fields(login = %user.login), err)]
    async fn register(&self, user: &NewUser) -> Result<UserId, StorageError> {
        let user_id = UserId::new();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("INSERT INTO users (id, login, password_hash) VALUES ($1, $2, $3)")
            .bind(user_id.as_uuid())
            .bind(&user.login)
            .bind(&user.password_hash)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_user", e))?;

        sqlx::query("INSERT INTO accounts (user_id) VALUES ($1)")
            .bind(user_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_account", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(user_id)
    }

    #[instrument(skip(self), err)]
    async fn login(&self, login: &str) -> Result<UserCredentials, StorageError> {
        let row = sqlx::query("SELECT id, login, password_hash FROM users WHERE login = $1")
            .bind(login)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("login", e))?
            .ok_or_else(|| StorageError::not_found(format!("user {login}")))?;

        Ok(UserCredentials {
            user_id: UserId::from_uuid(row.try_get("id").map_err(decode_error)?),
            login: row.try_get("login").map_err(decode_error)?,
            password_hash: row.try_get("password_hash").map_err(decode_error)?,
        })
    }

    #[instrument(skip(self), fields(order = %number), err)]
    async fn get_order_by_number(&self, number: &OrderNumber) -> Result<Order, StorageError> {
        let row = sqlx::query(
            "SELECT number, user_id, status, accrual, uploaded_at FROM orders WHERE number = $1",
        )
        .bind(number.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_order_by_number", e))?
        .ok_or_else(|| StorageError::not_found(format!("order {number}")))?;

        order_from_row(&row)
    }

    #[instrument(skip(self, order), fields(order = %order.number, user_id = %order.user_id), err)]
    async fn add_order(&self, order: &Order) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO orders (number, user_id, status, accrual, uploaded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(order.number.as_str())
        .bind(order.user_id.as_uuid())
        .bind(order.status.as_str())
        .bind(order.accrual.map(Points::hundredths))
        .bind(order.uploaded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("add_order", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(order = %number, status = %status), err)]
    async fn update_order_status(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
    ) -> Result<(), StorageError> {
        if status.is_terminal() {
            return Err(StorageError::conflict(format!(
                "{status} can only be set by processing the order"
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE orders SET status = $2
            WHERE number = $1 AND status NOT IN ('INVALID', 'PROCESSED')
            "#,
        )
        .bind(number.as_str())
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_order_status", e))?;

        if result.rows_affected() == 0 {
            // Either missing or already terminal.
            let existing = self.get_order_by_number(number).await?;
            return Err(StorageError::AlreadyFinalized(existing.number));
        }
        Ok(())
    }

    #[instrument(skip(self, order), fields(order = %order.number, status = %order.status), err)]
    async fn process_order(&self, order: &Order) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            SELECT number, user_id, status, accrual, uploaded_at
            FROM orders WHERE number = $1
            FOR UPDATE
            "#,
        )
        .bind(order.number.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_order", e))?
        .ok_or_else(|| StorageError::not_found(format!("order {}", order.number)))?;

        let mut stored = order_from_row(&row)?;
        if stored.is_terminal() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StorageError::AlreadyFinalized(stored.number));
        }
        stored
            .finalize(order.status, order.accrual)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let credit = stored.credit();

        sqlx::query(
            r#"
            INSERT INTO history (user_id, order_number, kind, amount, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(stored.user_id.as_uuid())
        .bind(stored.number.as_str())
        .bind(EntryKind::Accrual.as_str())
        .bind(credit.hundredths())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_history", e))?;

        let credited = sqlx::query("UPDATE accounts SET balance = balance + $2 WHERE user_id = $1")
            .bind(stored.user_id.as_uuid())
            .bind(credit.hundredths())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("credit_account", e))?;
        if credited.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StorageError::not_found(format!(
                "account of user {}",
                stored.user_id
            )));
        }

        sqlx::query("UPDATE orders SET status = $2, accrual = $3 WHERE number = $1")
            .bind(stored.number.as_str())
            .bind(stored.status.as_str())
            .bind(stored.accrual.map(Points::hundredths))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("finalize_order", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn list_orders(&self, user_id: UserId) -> Result<Vec<Order>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT number, user_id, status, accrual, uploaded_at
            FROM orders WHERE user_id = $1
            ORDER BY uploaded_at DESC
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_orders", e))?;

        rows.iter().map(order_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_unfinished_orders(&self) -> Result<Vec<Order>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT number, user_id, status, accrual, uploaded_at
            FROM orders WHERE status NOT IN ('INVALID', 'PROCESSED')
            ORDER BY uploaded_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_unfinished_orders", e))?;

        rows.iter().map(order_from_row).collect()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn get_account(&self, user_id: UserId) -> Result<Account, StorageError> {
        let row = sqlx::query("SELECT balance, withdrawn FROM accounts WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_account", e))?
            .ok_or_else(|| StorageError::not_found(format!("account of user {user_id}")))?;

        Ok(Account {
            user_id,
            balance: Points::from_hundredths(row.try_get("balance").map_err(decode_error)?),
            withdrawn: Points::from_hundredths(row.try_get("withdrawn").map_err(decode_error)?),
        })
    }

    #[instrument(
        skip(self, withdrawal),
        fields(user_id = %user_id, order = %withdrawal.order, sum = %withdrawal.sum),
        err
    )]
    async fn withdraw(&self, user_id: UserId, withdrawal: &Withdrawal) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let debited = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance - $2, withdrawn = withdrawn + $2
            WHERE user_id = $1 AND balance >= $2
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(withdrawal.sum.hundredths())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("debit_account", e))?;

        if debited.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            let account = self.get_account(user_id).await?;
            return Err(StorageError::InsufficientFunds(format!(
                "balance {}, requested {}",
                account.balance, withdrawal.sum
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO history (user_id, order_number, kind, amount, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(withdrawal.order.as_str())
        .bind(EntryKind::Withdrawn.as_str())
        .bind(withdrawal.sum.hundredths())
        .bind(withdrawal.processed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_history", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn list_withdrawals(&self, user_id: UserId) -> Result<Vec<Withdrawal>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT order_number, kind, amount, recorded_at
            FROM history WHERE user_id = $1 AND kind = 'withdrawn'
            ORDER BY recorded_at DESC, id DESC
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_withdrawals", e))?;

        rows.iter()
            .map(|row| {
                let entry = entry_from_row(row)?;
                Ok(Withdrawal {
                    order: entry.order,
                    sum: entry.amount,
                    processed_at: entry.recorded_at,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn ledger_entries(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT order_number, kind, amount, recorded_at
            FROM history WHERE user_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_entries", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }
}

fn order_from_row(row: &PgRow) -> Result<Order, StorageError> {
    let number: String = row.try_get("number").map_err(decode_error)?;
    let user_id: Uuid = row.try_get("user_id").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let accrual: Option<i64> = row.try_get("accrual").map_err(decode_error)?;
    let uploaded_at: DateTime<Utc> = row.try_get("uploaded_at").map_err(decode_error)?;

    Ok(Order {
        number: OrderNumber::parse(&number).map_err(|e| StorageError::Backend(e.to_string()))?,
        user_id: UserId::from_uuid(user_id),
        status: status
            .parse()
            .map_err(|e: loyalty_core::DomainError| StorageError::Backend(e.to_string()))?,
        accrual: accrual.map(Points::from_hundredths),
        uploaded_at,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, StorageError> {
    let order: String = row.try_get("order_number").map_err(decode_error)?;
    let kind: String = row.try_get("kind").map_err(decode_error)?;
    let amount: i64 = row.try_get("amount").map_err(decode_error)?;

    Ok(LedgerEntry {
        order: OrderNumber::parse(&order).map_err(|e| StorageError::Backend(e.to_string()))?,
        kind: kind
            .parse()
            .map_err(|e: loyalty_core::DomainError| StorageError::Backend(e.to_string()))?,
        amount: Points::from_hundredths(amount),
        recorded_at: row.try_get("recorded_at").map_err(decode_error)?,
    })
}

fn decode_error(err: sqlx::Error) -> StorageError {
    StorageError::Backend(format!("failed to decode row: {err}"))
}

/// Map SQLx errors to StorageError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code == "23505" => StorageError::Conflict(msg),
                Some(code) if code == "23503" => StorageError::NotFound(msg),
                Some(code) if is_connection_class(&code) => StorageError::Unavailable(msg),
                _ => StorageError::Backend(msg),
            }
        }
        sqlx::Error::Io(e) => {
            StorageError::Unavailable(format!("i/o error in {}: {}", operation, e))
        }
        sqlx::Error::Tls(e) => {
            StorageError::Unavailable(format!("tls error in {}: {}", operation, e))
        }
        sqlx::Error::PoolTimedOut => {
            StorageError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StorageError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StorageError::NotFound(format!("row not found in {}", operation))
        }
        _ => StorageError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// SQLSTATE codes that mean the connection, not the statement, failed.
fn is_connection_class(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03" | "53300")
}
