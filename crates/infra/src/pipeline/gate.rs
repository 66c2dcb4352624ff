use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared pause honoured by every worker before calling the authority.
#[derive(Debug, Default)]
pub(crate) struct AuthorityGate {
    reopen_at: Mutex<Option<Instant>>,
}

impl AuthorityGate {
    /// Keep the gate closed for at least `pause` from now.
    pub fn close_for(&self, pause: Duration) {
        let until = Instant::now() + pause;
        let mut reopen_at = match self.reopen_at.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if reopen_at.is_none_or(|current| current < until) {
            *reopen_at = Some(until);
        }
    }

    fn reopen_at(&self) -> Option<Instant> {
        match self.reopen_at.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Wait until the gate is open. Returns `false` if `shutdown` fired first.
    pub async fn wait(&self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.reopen_at() {
                Some(until) if until > Instant::now() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return false,
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                _ => return !shutdown.is_cancelled(),
            }
        }
    }
}
