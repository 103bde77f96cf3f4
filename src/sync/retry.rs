//! In-process retry with exponential backoff for transient unit errors.

use crate::sync::cancel::CancelHandle;
use crate::sync::error::SyncError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        use crate::util::env::env_parse;
        Self {
            max_attempts: env_parse("SYNC_MAX_RETRIES", 3u32).max(1),
            base_delay: Duration::from_millis(env_parse("SYNC_BACKOFF_BASE_MS", 300u64)),
            max_delay: Duration::from_millis(env_parse("SYNC_BACKOFF_MAX_MS", 30_000u64)),
        }
    }

    /// Delay before the attempt after `attempt` (1-based): base doubling per
    /// attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        (self.base_delay * factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails non-transiently, or the attempt
    /// ceiling is hit. Only `SyncError::Transient` is retried; permanent and
    /// fatal errors return immediately, as does an observed cancellation.
    /// Backoff sleeps are cut short when the cancel signal fires.
    pub async fn run<T, F, Fut>(&self, cancel: &CancelHandle, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            cancel.check()?;
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(SyncError::Transient(cause)) if attempt < self.max_attempts => {
                    let delay = jitter(self.delay_for(attempt));
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %cause,
                        "transient failure; backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Up to +20% so concurrent retries against the same host spread out.
fn jitter(d: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0..=d.as_millis() as u64 / 5);
    d + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::cancel::CancelReason;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(10), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn transient_twice_then_success_within_ceiling() {
        let calls = AtomicU32::new(0);
        let cancel = CancelHandle::new();
        let result = fast_policy()
            .run(&cancel, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(SyncError::transient(anyhow::anyhow!("attempt {n} flaked")))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let cancel = CancelHandle::new();
        let result: Result<(), _> = fast_policy()
            .run(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::transient(anyhow::anyhow!("still down"))) }
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancelHandle::new();
        let result: Result<(), _> = fast_policy()
            .run(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::validation("malformed row")) }
            })
            .await;
        assert!(matches!(
            result.unwrap_err(),
            SyncError::Permanent { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_preempts_next_attempt() {
        let cancel = CancelHandle::new();
        cancel.cancel(CancelReason::UserRequested);
        let result: Result<(), _> = fast_policy()
            .run(&cancel, |_| async {
                panic!("op must not run after cancellation")
            })
            .await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
