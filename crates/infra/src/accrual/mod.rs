//! Client side of the external accrual authority.

pub mod client;
pub mod http;

pub use client::{AccrualClient, AccrualError, AccrualStatus, AccrualVerdict};
pub use http::HttpAccrualClient;
