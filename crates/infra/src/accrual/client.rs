use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use loyalty_core::{OrderNumber, OrderStatus, Points};

/// Processing state reported by the accrual authority.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    /// Known to the authority, calculation not started.
    Registered,
    Processing,
    /// Rejected; no reward will ever be granted.
    Invalid,
    /// Reward calculated.
    Processed,
}

impl AccrualStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AccrualStatus::Invalid | AccrualStatus::Processed)
    }

    /// Order status this verdict corresponds to.
    pub fn order_status(&self) -> OrderStatus {
        match self {
            AccrualStatus::Registered => OrderStatus::New,
            AccrualStatus::Processing => OrderStatus::Processing,
            AccrualStatus::Invalid => OrderStatus::Invalid,
            AccrualStatus::Processed => OrderStatus::Processed,
        }
    }
}

/// The authority's answer for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccrualVerdict {
    #[serde(rename = "order")]
    pub number: OrderNumber,
    pub status: AccrualStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Points>,
}

/// Classified failure of one authority call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccrualError {
    #[error("accrual authority rate limit, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("order is not registered with the accrual authority")]
    NotFound,

    #[error("accrual authority unavailable: {0}")]
    Unavailable(String),

    #[error("malformed accrual response: {0}")]
    Malformed(String),

    #[error("accrual transport error: {0}")]
    Transport(String),
}

/// One network round-trip per order number.
#[async_trait::async_trait]
pub trait AccrualClient: Send + Sync {
    async fn fetch(&self, number: &OrderNumber) -> Result<AccrualVerdict, AccrualError>;
}

#[async_trait::async_trait]
impl<C> AccrualClient for Arc<C>
where
    C: AccrualClient + ?Sized,
{
    async fn fetch(&self, number: &OrderNumber) -> Result<AccrualVerdict, AccrualError> {
        (**self).fetch(number).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_decodes_authority_json() {
        let verdict: AccrualVerdict = serde_json::from_str(
            r#"{"order":"79927398713","status":"PROCESSED","accrual":729.98}"#,
        )
        .unwrap();

        assert_eq!(verdict.status, AccrualStatus::Processed);
        assert_eq!(verdict.accrual, Some(Points::from_hundredths(72_998)));
        assert_eq!(verdict.status.order_status(), OrderStatus::Processed);
    }

    #[test]
    fn accrual_is_optional() {
        let verdict: AccrualVerdict =
            serde_json::from_str(r#"{"order":"79927398713","status":"REGISTERED"}"#).unwrap();

        assert_eq!(verdict.accrual, None);
        assert!(!verdict.status.is_terminal());
    }
}
