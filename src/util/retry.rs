use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Reusable retry policy: bounded attempts with exponential backoff and
/// full jitter.
///
/// Call sites parameterize their own budgets instead of duplicating ad hoc
/// retry loops; the policy itself knows nothing about the operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each subsequent retry.
    pub base_delay: Duration,
    /// Ceiling applied to the computed delay.
    pub max_delay: Duration,
    /// When set, each delay is drawn uniformly from [0, computed delay].
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy for transient network I/O: 3 attempts, 500ms base.
    pub fn transient_io() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }

    /// Policy for per-item persistence: 3 attempts, quick retries.
    pub fn persistence() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }

    /// Policy with `attempts` total tries and the transient-I/O delays.
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Self::transient_io()
        }
    }

    /// Delay to sleep before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay);
        if self.jitter && !exp.is_zero() {
            let micros = rand::rng().random_range(0..=exp.as_micros() as u64);
            Duration::from_micros(micros)
        } else {
            exp
        }
    }

    /// Runs `op` until it succeeds or the attempt budget is exhausted.
    ///
    /// Returns the last error when all attempts fail. Failed attempts are
    /// logged at warn level with the attempt number.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation = what,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
