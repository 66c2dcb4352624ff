//! Ledger storage boundary.
//!
//! [`LedgerStorage`] is the capability the rest of the service talks to. It has
//! one production backend ([`PostgresLedgerStorage`]), one in-memory backend for
//! tests/dev ([`InMemoryLedgerStorage`]) and one decorator that composes any
//! backend with transparent retries on connection loss ([`RetryingStorage`]).

pub mod in_memory;
pub mod postgres;
pub mod retrying;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStorage;
pub use postgres::PostgresLedgerStorage;
pub use retrying::{RetryPredicate, RetryingStorage};
pub use r#trait::{LedgerStorage, NewUser, StorageError, UserCredentials};
