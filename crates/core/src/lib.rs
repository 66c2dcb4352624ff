//! `loyalty-core`: domain building blocks of the points-accrual service.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! order numbers, order lifecycle, point amounts, accounts and ledger entries.

pub mod account;
pub mod error;
pub mod id;
pub mod order;
pub mod points;

pub use account::{history_balance, Account, EntryKind, LedgerEntry, Withdrawal};
pub use error::{DomainError, DomainResult};
pub use id::UserId;
pub use order::{Order, OrderNumber, OrderStatus};
pub use points::Points;
