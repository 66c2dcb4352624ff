use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use tracing::{debug, instrument};

use loyalty_core::OrderNumber;

use super::client::{AccrualClient, AccrualError, AccrualVerdict};

/// Pause applied when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// HTTP client for the accrual authority (`GET {base}/api/orders/{number}`).
#[derive(Debug, Clone)]
pub struct HttpAccrualClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccrualClient {
    /// `address` may be a bare `host:port`; `http://` is assumed then.
    pub fn new(address: &str, timeout: Duration) -> Result<Self, AccrualError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AccrualError::Transport(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: normalize_base_url(address),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl AccrualClient for HttpAccrualClient {
    #[instrument(skip(self), fields(order = %number))]
    async fn fetch(&self, number: &OrderNumber) -> Result<AccrualVerdict, AccrualError> {
        let url = format!("{}/api/orders/{}", self.base_url, number);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AccrualError::Transport(e.to_string()))?;

        let status = response.status();
        debug!(status = status.as_u16(), "accrual response");

        match status {
            StatusCode::OK => {
                let verdict: AccrualVerdict = response
                    .json()
                    .await
                    .map_err(|e| AccrualError::Malformed(e.to_string()))?;
                if &verdict.number != number {
                    return Err(AccrualError::Malformed(format!(
                        "asked for order {number}, got {}",
                        verdict.number
                    )));
                }
                Ok(verdict)
            }
            StatusCode::NO_CONTENT => Err(AccrualError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after)
                    .unwrap_or(DEFAULT_RETRY_AFTER);
                Err(AccrualError::RateLimited { retry_after })
            }
            s if s.is_server_error() => Err(AccrualError::Unavailable(format!("status {s}"))),
            s => Err(AccrualError::Malformed(format!("unexpected status {s}"))),
        }
    }
}

fn normalize_base_url(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Parse a `Retry-After` value: integer seconds, or a number with an
/// `ms`, `s` or `m` suffix.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let secs = if let Some(n) = raw.strip_suffix("ms") {
        n.trim().parse::<f64>().ok()? / 1000.0
    } else if let Some(n) = raw.strip_suffix('s') {
        n.trim().parse::<f64>().ok()?
    } else if let Some(n) = raw.strip_suffix('m') {
        n.trim().parse::<f64>().ok()? * 60.0
    } else {
        return None;
    };

    Duration::try_from_secs_f64(secs).ok()
}
