//! Centralised retry/backoff policy for backend calls.
//!
//! One policy object per backend kind, applied uniformly wherever the engine
//! touches an adapter. Transient failures (timeouts, throttling, connection
//! errors) retry with bounded exponential backoff and jitter; permanent
//! failures surface immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use stowage_core::BackendError;

use crate::config::KindLimits;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Applied to every individual attempt.
    pub op_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_limits(limits: &KindLimits) -> Self {
        Self {
            max_attempts: limits.max_attempts.max(1),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            op_timeout: Duration::from_secs(limits.op_timeout_secs),
        }
    }

    /// Run `op`, retrying transient failures until `max_attempts` is
    /// exhausted. Each attempt is bounded by `op_timeout`; a timed-out
    /// attempt counts as transient.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, BackendError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.op_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Transient(format!(
                    "operation timed out after {:?}",
                    self.op_timeout
                ))),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => e,
                Err(e) => return Err(e),
            };

            let delay = self.backoff_delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying backend call");
            tokio::time::sleep(delay).await;
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << (attempt - 1).min(16))
            .min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter_ms)
    }
}
