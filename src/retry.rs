//! Bounded retry with doubling backoff, for best-effort teardown only.
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub async fn with_backoff<T, O, Fut>(policy: RetryPolicy, what: &str, mut operation: O) -> Result<T>
where
    O: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.attempts.max(1) => {
                let delay = policy.delay_for(attempt);
                warn!(?err, attempt, delay_ms = delay.as_millis() as u64, "{} failed; retrying", what);
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err.context(format!("{} failed after {} attempts", what, attempt))),
        }
    }
}
