// ABOUTME: Bounded exponential backoff shared by registry, cluster, and coordinator retries.
// ABOUTME: Transient failures are retried locally; everything else returns immediately.

use std::future::Future;
use std::time::Duration;

/// Upper bound on any single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(300);

/// Retry budget: `retries` extra attempts after the first, waiting
/// `base * 2^(attempt - 1)` before retry number `attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub retries: u32,
    pub base: Duration,
}

impl Backoff {
    pub fn new(retries: u32, base: Duration) -> Self {
        Self { retries, base }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent. The last error is returned on exhaustion.
    pub async fn retry<T, E, F, Fut>(
        &self,
        what: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.retries => {
                    attempt += 1;
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
