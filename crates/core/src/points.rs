//! Point amounts in fixed-point form.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DomainError;

/// An amount of loyalty points, stored in hundredths (the smallest unit).
///
/// The accrual authority and the public API speak decimal numbers
/// (`729.98`); the ledger never does float arithmetic.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Points(i64);

impl Points {
    pub const ZERO: Points = Points(0);

    pub const fn from_hundredths(hundredths: i64) -> Self {
        Self(hundredths)
    }

    pub const fn hundredths(self) -> i64 {
        self.0
    }

    /// Whole points, for tests and literals.
    pub const fn whole(points: i64) -> Self {
        Self(points * 100)
    }

    /// Convert a decimal amount, rounding to the nearest hundredth.
    pub fn from_decimal(value: f64) -> Result<Self, DomainError> {
        if !value.is_finite() {
            return Err(DomainError::validation(format!("amount is not finite: {value}")));
        }
        let scaled = (value * 100.0).round();
        if scaled.abs() > i64::MAX as f64 {
            return Err(DomainError::validation(format!("amount out of range: {value}")));
        }
        Ok(Self(scaled as i64))
    }

    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Points) -> Option<Points> {
        self.0.checked_add(other.0).map(Points)
    }

    pub fn checked_sub(self, other: Points) -> Option<Points> {
        self.0.checked_sub(other.0).map(Points)
    }
}

impl core::fmt::Display for Points {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Serialize for Points {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_decimal())
    }
}

impl<'de> Deserialize<'de> for Points {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Points::from_decimal(value).map_err(serde::de::Error::custom)
    }
}
