//! Orders and their processing lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::UserId;
use crate::points::Points;

/// A Luhn-valid order number, as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNumber(String);

impl OrderNumber {
    /// Parse and validate an order number: digits only, at least two of them,
    /// and a valid Luhn checksum.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let raw = raw.trim();
        if raw.len() < 2 {
            return Err(DomainError::validation("order number is too short"));
        }
        if !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::validation(format!(
                "order number must contain digits only: {raw}"
            )));
        }
        if !luhn_valid(raw) {
            return Err(DomainError::validation(format!(
                "order number fails checksum: {raw}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn luhn_valid(digits: &str) -> bool {
    let sum: u32 = digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(pos, b)| {
            let d = u32::from(b - b'0');
            if pos % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

impl core::fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OrderNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OrderNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OrderNumber> for String {
    fn from(value: OrderNumber) -> Self {
        value.0
    }
}

/// Processing status of an order, as stored in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Uploaded, not yet looked at by the accrual pipeline
    New,
    /// The accrual authority has not reached a verdict yet
    Processing,
    /// Rejected; no points are credited
    Invalid,
    /// Reward computed and credited
    Processed,
}

impl OrderStatus {
    /// `INVALID` and `PROCESSED` never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "INVALID" => Ok(OrderStatus::Invalid),
            "PROCESSED" => Ok(OrderStatus::Processed),
            other => Err(DomainError::validation(format!("unknown order status: {other}"))),
        }
    }
}

/// An order submitted by a user for point accrual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub number: OrderNumber,
    pub user_id: UserId,
    pub status: OrderStatus,
    /// Reward; only meaningful once the order is `PROCESSED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Points>,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// A freshly uploaded order in `NEW` state.
    pub fn new(number: OrderNumber, user_id: UserId) -> Self {
        Self {
            number,
            user_id,
            status: OrderStatus::New,
            accrual: None,
            uploaded_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Points to credit when this order is finalized (zero unless processed).
    pub fn credit(&self) -> Points {
        match self.status {
            OrderStatus::Processed => self.accrual.unwrap_or(Points::ZERO),
            _ => Points::ZERO,
        }
    }

    /// Move the order to a terminal state.
    ///
    /// `INVALID` orders never carry an accrual.
    pub fn finalize(&mut self, status: OrderStatus, accrual: Option<Points>) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::invariant(format!(
                "order {} is already {}",
                self.number, self.status
            )));
        }
        if !status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "{status} is not a terminal status"
            )));
        }
        let accrual = match status {
            OrderStatus::Processed => accrual.unwrap_or(Points::ZERO),
            _ => Points::ZERO,
        };
        if accrual.is_negative() {
            return Err(DomainError::validation("accrual must not be negative"));
        }
        self.status = status;
        self.accrual = Some(accrual);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_luhn_valid_numbers() {
        for raw in ["12345678903", "79927398713", "4561261212345467", "18"] {
            assert!(OrderNumber::parse(raw).is_ok(), "{raw} should be valid");
        }
    }

    #[test]
    fn rejects_bad_numbers() {
        for raw in ["12345678900", "1", "", "1234abcd", "79927398710"] {
            assert!(
                matches!(OrderNumber::parse(raw), Err(DomainError::Validation(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn deserializing_validates_the_checksum() {
        let ok: Result<OrderNumber, _> = serde_json::from_value(serde_json::json!("12345678903"));
        assert!(ok.is_ok());
        let bad: Result<OrderNumber, _> = serde_json::from_value(serde_json::json!("12345678900"));
        assert!(bad.is_err());
    }

    #[test]
    fn status_wire_format() {
        assert_eq!(serde_json::to_value(OrderStatus::Processed).unwrap(), "PROCESSED");
        assert_eq!("INVALID".parse::<OrderStatus>().unwrap(), OrderStatus::Invalid);
        assert!(OrderStatus::Processed.is_terminal());
        assert!(OrderStatus::Invalid.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
    }

    #[test]
    fn finalize_happens_once() {
        let mut order = Order::new(OrderNumber::parse("12345678903").unwrap(), UserId::new());
        order.finalize(OrderStatus::Processed, Some(Points::whole(500))).unwrap();
        assert_eq!(order.credit(), Points::whole(500));

        let err = order.finalize(OrderStatus::Invalid, None).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(order.status, OrderStatus::Processed);
    }

    #[test]
    fn invalid_orders_credit_nothing() {
        let mut order = Order::new(OrderNumber::parse("12345678903").unwrap(), UserId::new());
        order.finalize(OrderStatus::Invalid, Some(Points::whole(10))).unwrap();
        assert_eq!(order.accrual, Some(Points::ZERO));
        assert_eq!(order.credit(), Points::ZERO);
    }

    #[test]
    fn finalize_rejects_non_terminal_status() {
        let mut order = Order::new(OrderNumber::parse("12345678903").unwrap(), UserId::new());
        assert!(order.finalize(OrderStatus::Processing, None).is_err());
        assert_eq!(order.status, OrderStatus::New);
    }

    fn check_digit(payload: &str) -> char {
        (0..10u8)
            .map(|d| (b'0' + d) as char)
            .find(|d| luhn_valid(&format!("{payload}{d}")))
            .unwrap()
    }

    proptest! {
        /// Property: appending the Luhn check digit always yields a valid
        /// number, and altering the check digit always breaks it.
        #[test]
        fn check_digit_round_trip(payload in "[0-9]{1,18}", bump in 1u8..10) {
            let digit = check_digit(&payload);
            let valid = format!("{payload}{digit}");
            prop_assert!(OrderNumber::parse(&valid).is_ok());

            let altered = (b'0' + ((digit as u8 - b'0') + bump) % 10) as char;
            let invalid = format!("{payload}{altered}");
            prop_assert!(OrderNumber::parse(&invalid).is_err());
        }
    }
}
